/// BBCode image embed that forums accept as an avatar/signature snippet.
pub fn image_embed(image_url: &str) -> String {
    format!("[img]{image_url}[/img]")
}
