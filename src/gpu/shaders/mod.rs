//! WGSL shader sources for the GPU backend.

/// Default invocations per workgroup.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

/// Returns the grouped convolution compute shader with entry point `main`.
///
/// Bindings in group 0: `0` the packed layer (read), `1` the unpadded input
/// (read), `2` the output (read-write). One invocation computes one output
/// element; invocations past the end of the output return immediately.
pub fn get_convolution_wgsl(workgroup_size: u32) -> String {
    format!(
        r#"// Grouped convolution
// Generated with workgroup_size = {workgroup_size}

const WORKGROUP_SIZE: u32 = {workgroup_size}u;

{convolution}
"#,
        workgroup_size = workgroup_size.max(1),
        convolution = include_str!("convolution.wgsl"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_entry_points() {
        let wgsl = get_convolution_wgsl(DEFAULT_WORKGROUP_SIZE);
        assert!(wgsl.contains("fn main("));
        assert!(wgsl.contains("fn activate("));
        assert!(wgsl.contains("@workgroup_size(WORKGROUP_SIZE)"));
    }

    #[test]
    fn test_workgroup_size_substitution() {
        assert!(get_convolution_wgsl(32).contains("const WORKGROUP_SIZE: u32 = 32u;"));
        assert!(get_convolution_wgsl(0).contains("const WORKGROUP_SIZE: u32 = 1u;"));
    }
}
