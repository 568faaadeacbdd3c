//! Graph execution tests: blob wiring, sessions, threading and layouts.

use std::sync::Arc;

use blobnet_inference::errors::{LayerError, NetError, STATUS_ALLOCATION_FAILURE};
use blobnet_inference::layers::crop::CROP_AUTO;
use blobnet_inference::{
    LayerDefinition, Mat, ModelBinFromBytes, ModelBinFromMatArray, Net, NetDefinition, ParamDict,
    PoolAllocator, RuntimeConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn grid(w: usize, h: usize, c: usize) -> Mat {
    let data: Vec<f32> = (0..w * h * c).map(|v| v as f32).collect();
    Mat::from_slice_3d(w, h, c, &data).unwrap()
}

fn signed_grid(w: usize, h: usize, c: usize) -> Mat {
    let data: Vec<f32> = (0..w * h * c)
        .map(|v| ((v * 37) % 23) as f32 / 7.0 - 1.5)
        .collect();
    Mat::from_slice_3d(w, h, c, &data).unwrap()
}

fn bits(mat: &Mat) -> Vec<u32> {
    mat.as_slice::<f32>().iter().map(|v| v.to_bits()).collect()
}

#[cfg(test)]
mod graph_tests {
    use super::*;

    fn split_crop_net() -> Net {
        let def = NetDefinition::new()
            .with_layer(LayerDefinition::new("Input", "data", &[], &["data"]))
            .with_layer(LayerDefinition::new("Input", "shape", &[], &["shape"]))
            .with_layer(LayerDefinition::new("Split", "split", &["data"], &["a", "b"]))
            .with_layer(LayerDefinition::new("ReLU", "relu", &["a"], &["a_relu"]))
            .with_layer(
                LayerDefinition::new("Crop", "crop", &["b", "shape"], &["crop"]).with_params(
                    ParamDict::new()
                        .with_int(0, CROP_AUTO)
                        .with_int(1, CROP_AUTO),
                ),
            );
        let mut net = Net::new();
        net.load_param(&def).unwrap();
        net
    }

    #[test]
    fn test_split_feeds_two_branches() {
        init_logging();
        let net = split_crop_net();
        assert_eq!(net.input_names(), vec!["data", "shape"]);
        assert_eq!(net.output_names(), vec!["a_relu", "crop"]);

        let mut ex = net.create_extractor();
        ex.input("data", grid(4, 4, 1)).unwrap();
        ex.input("shape", Mat::create_3d(2, 2, 1, 4, None).unwrap())
            .unwrap();

        let crop = ex.extract("crop").unwrap();
        assert_eq!((crop.w(), crop.h(), crop.c()), (2, 2, 1));
        assert_eq!(crop.as_slice::<f32>(), &[5.0, 6.0, 9.0, 10.0]);

        let relu = ex.extract("a_relu").unwrap();
        assert_eq!(relu.as_slice::<f32>(), grid(4, 4, 1).as_slice::<f32>());
    }

    #[test]
    fn test_extract_by_index() {
        let net = split_crop_net();
        let mut ex = net.create_extractor();
        let data = net.blob_index("data").unwrap();
        ex.input_index(data, grid(4, 4, 1)).unwrap();

        let a = ex.extract_index(net.blob_index("a").unwrap()).unwrap();
        assert_eq!(a.total(), 16);

        let err = ex.extract_index(99).unwrap_err();
        assert_eq!(err, NetError::BlobIndexOutOfBounds { index: 99, count: 6 });
        assert!(!ex.is_poisoned());
    }

    #[test]
    fn test_missing_input_poisons_session() {
        let net = split_crop_net();
        let mut ex = net.create_extractor();
        ex.input("data", grid(4, 4, 1)).unwrap();

        let err = ex.extract("crop").unwrap_err();
        assert_eq!(err, NetError::MissingInput { name: "shape".to_string() });
        assert!(ex.is_poisoned());

        assert_eq!(ex.extract("a_relu").unwrap_err(), NetError::SessionPoisoned);
        assert_eq!(
            ex.input("shape", grid(2, 2, 1)).unwrap_err(),
            NetError::SessionPoisoned
        );

        // a fresh session on the same net is unaffected
        let mut ex = net.create_extractor();
        ex.input("data", grid(4, 4, 1)).unwrap();
        assert!(ex.extract("a_relu").is_ok());
    }

    #[test]
    fn test_input_mat_is_not_mutated() {
        let def = NetDefinition::new()
            .with_layer(LayerDefinition::new("Input", "data", &[], &["data"]))
            .with_layer(LayerDefinition::new("ReLU", "relu", &["data"], &["relu"]));
        let mut net = Net::new();
        net.load_param(&def).unwrap();

        let input = Mat::from_slice_3d(3, 1, 1, &[-1.0f32, 0.5, -3.0]).unwrap();
        let mut ex = net.create_extractor();
        ex.input("data", input.clone()).unwrap();
        let out = ex.extract("relu").unwrap();

        assert_eq!(out.as_slice::<f32>(), &[0.0, 0.5, 0.0]);
        assert_eq!(input.as_slice::<f32>(), &[-1.0, 0.5, -3.0]);
        assert_eq!(ex.extract("data").unwrap().as_slice::<f32>(), &[-1.0, 0.5, -3.0]);
    }
}

#[cfg(test)]
mod threading_tests {
    use super::*;

    fn conv_net() -> Net {
        let def = NetDefinition::new()
            .with_layer(LayerDefinition::new("Input", "data", &[], &["data"]))
            .with_layer(
                LayerDefinition::new("Convolution", "conv", &["data"], &["conv"]).with_params(
                    ParamDict::new()
                        .with_int(0, 8)
                        .with_int(1, 3)
                        .with_int(4, 1)
                        .with_int(5, 1)
                        .with_int(6, 8 * 8 * 9)
                        .with_int(9, 1),
                ),
            )
            .with_layer(
                LayerDefinition::new("ConvolutionDepthWise", "dw", &["conv"], &["dw"]).with_params(
                    ParamDict::new()
                        .with_int(0, 8)
                        .with_int(1, 3)
                        .with_int(3, 2)
                        .with_int(6, 8 * 9)
                        .with_int(7, 8)
                        .with_int(9, 2)
                        .with_array(10, vec![0.1]),
                ),
            );

        let weights = |len: usize, seed: usize| -> Mat {
            let data: Vec<f32> = (0..len)
                .map(|i| (((i + seed) * 7919) % 101) as f32 / 101.0 - 0.5)
                .collect();
            Mat::from_slice_1d(&data).unwrap()
        };

        let mut net = Net::new();
        net.load_param(&def).unwrap();
        net.load_model(&mut ModelBinFromMatArray::new(vec![
            weights(8 * 8 * 9, 1),
            weights(8, 2),
            weights(8 * 9, 3),
        ]))
        .unwrap();
        net
    }

    fn run(net: &Net, threads: usize) -> Mat {
        let mut ex = net.create_extractor();
        ex.set_num_threads(threads);
        ex.input("data", signed_grid(13, 11, 8)).unwrap();
        ex.extract("dw").unwrap()
    }

    #[test]
    fn test_repeated_runs_are_bit_identical() {
        init_logging();
        let net = conv_net();
        let first = run(&net, 1);
        let second = run(&net, 1);
        assert_eq!((first.w(), first.h(), first.c()), (6, 5, 8));
        assert_eq!(bits(&first), bits(&second));
    }

    #[test]
    fn test_thread_count_does_not_change_output() {
        let net = conv_net();
        let single = run(&net, 1);
        for threads in [2, 3, 4, 8] {
            assert_eq!(bits(&single), bits(&run(&net, threads)), "{threads} threads");
        }
    }
}

#[cfg(test)]
mod allocation_tests {
    use super::*;

    #[test]
    fn test_exhausted_blob_pool_reports_allocation_failure() {
        let def = NetDefinition::new()
            .with_layer(LayerDefinition::new("Input", "data", &[], &["data"]))
            .with_layer(
                LayerDefinition::new("Convolution", "conv", &["data"], &["conv"]).with_params(
                    ParamDict::new().with_int(0, 2).with_int(1, 1).with_int(6, 2),
                ),
            );
        let mut net = Net::new();
        net.load_param(&def).unwrap();
        net.load_model(&mut ModelBinFromMatArray::new(vec![
            Mat::from_slice_1d(&[1.0f32, 2.0]).unwrap(),
        ]))
        .unwrap();

        let mut ex = net.create_extractor();
        ex.set_blob_allocator(Arc::new(PoolAllocator::new().with_capacity_limit(16)));
        ex.input("data", grid(4, 4, 1)).unwrap();

        let err = ex.extract("conv").unwrap_err();
        assert!(matches!(
            err,
            NetError::LayerFailed {
                source: LayerError::AllocationFailure { .. },
                ..
            }
        ));
        assert_eq!(err.status_code(), STATUS_ALLOCATION_FAILURE);
        assert!(ex.is_poisoned());
    }
}

#[cfg(test)]
mod definition_tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_json_definition_with_byte_weights() {
        let json = r#"{
            "layers": [
                {"type": "Input", "name": "data", "tops": ["data"], "params": {"0": 2, "1": 1, "2": 2}},
                {"type": "BatchNorm", "name": "bn", "bottoms": ["data"], "tops": ["bn"], "params": {"0": 2}}
            ]
        }"#;
        let mut net = Net::new();
        net.load_param_json(json).unwrap();

        let mut weights = Vec::new();
        for values in [[1.0f32, 2.0], [0.0, 1.0], [1.0, 4.0], [0.5, 0.0]] {
            weights.extend(f32_bytes(&values));
        }
        let mut mb = ModelBinFromBytes::new(&weights);
        net.load_model(&mut mb).unwrap();
        assert_eq!(mb.remaining(), 0);

        let mut ex = net.create_extractor();
        ex.input("data", Mat::from_slice_3d(2, 1, 2, &[1.0f32, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        let out = ex.extract("bn").unwrap();
        assert_eq!(out.as_slice::<f32>(), &[1.5, 2.5, 2.0, 3.0]);
    }

    #[test]
    fn test_truncated_weights_fail_the_load() {
        let json = r#"{"layers": [
            {"type": "Input", "name": "data", "tops": ["data"]},
            {"type": "BatchNorm", "name": "bn", "bottoms": ["data"], "tops": ["bn"], "params": {"0": 2}}
        ]}"#;
        let mut net = Net::new();
        net.load_param_json(json).unwrap();

        let weights = f32_bytes(&[1.0, 1.0, 0.0]);
        let err = net.load_model(&mut ModelBinFromBytes::new(&weights)).unwrap_err();
        assert!(matches!(err, NetError::LayerFailed { ref layer, .. } if layer == "bn"));
        assert_eq!(err.status_code(), -1);
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    fn relu_bn_net() -> Net {
        let def = NetDefinition::new()
            .with_layer(LayerDefinition::new("Input", "data", &[], &["data"]))
            .with_layer(
                LayerDefinition::new("ReLU", "relu", &["data"], &["relu"])
                    .with_params(ParamDict::new().with_float(0, 0.25)),
            )
            .with_layer(
                LayerDefinition::new("BatchNorm", "bn", &["relu"], &["bn"])
                    .with_params(ParamDict::new().with_int(0, 8)),
            )
            .with_layer(LayerDefinition::new("ReLU", "relu2", &["bn"], &["out"]));
        let mut net = Net::new();
        net.load_param(&def).unwrap();

        let per_channel = |f: fn(usize) -> f32| -> Mat {
            let data: Vec<f32> = (0..8).map(f).collect();
            Mat::from_slice_1d(&data).unwrap()
        };
        net.load_model(&mut ModelBinFromMatArray::new(vec![
            per_channel(|i| 1.0 + i as f32 * 0.25),
            per_channel(|i| i as f32 * 0.125),
            per_channel(|_| 1.0),
            per_channel(|i| if i % 2 == 0 { 0.5 } else { -0.5 }),
        ]))
        .unwrap();
        net
    }

    #[test]
    fn test_packed_layout_matches_unpacked() {
        let net = relu_bn_net();
        let input = signed_grid(5, 3, 8);

        let mut plain = net.create_extractor();
        plain.input("data", input.clone()).unwrap();
        let expected = plain.extract("out").unwrap();

        let mut packed = net.create_extractor();
        packed.set_packing_layout(true);
        packed.input("data", input).unwrap();
        let actual = packed.extract("out").unwrap();

        assert_eq!(actual.elempack(), 1);
        assert_eq!((actual.w(), actual.h(), actual.c()), (5, 3, 8));
        assert_eq!(bits(&actual), bits(&expected));
    }

    #[test]
    fn test_fp16_storage_stays_close() {
        let net = relu_bn_net();
        let input = signed_grid(5, 3, 8);

        let mut plain = net.create_extractor();
        plain.input("data", input.clone()).unwrap();
        let expected = plain.extract("out").unwrap();

        let mut half = net.create_extractor();
        half.set_fp16_storage(true);
        half.input("data", input).unwrap();
        let actual = half.extract("out").unwrap();

        assert_eq!(actual.elemsize(), 4);
        for (a, e) in actual.as_slice::<f32>().iter().zip(expected.as_slice::<f32>()) {
            assert!((a - e).abs() < 1e-2, "got {a}, expected {e}");
        }
    }
}
