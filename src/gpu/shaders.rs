/// Fused elementwise kernel skeleton.
///
/// Placeholders: `{{name}}`, `{{bindings}}`, `{{workgroup_size}}`, `{{body}}`.
/// The output buffer is always named `out` and sized to the element count.
pub const ELEMENTWISE: &str = include_str!("shaders/elementwise.wgsl");
