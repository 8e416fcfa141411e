pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Splits `name[:tag]` into name and tag. A colon that appears before the
/// last `/` belongs to the registry host (`registry:5000/app`).
pub fn split_image_name_and_tag(image: &str) -> (String, String) {
    let last_slash = image.rfind('/');
    match image.rfind(':') {
        Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
            let tag = &image[colon + 1..];
            let tag = if tag.is_empty() { DEFAULT_IMAGE_TAG } else { tag };
            (image[..colon].to_string(), tag.to_string())
        }
        _ => (image.to_string(), DEFAULT_IMAGE_TAG.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_name_and_tag() {
        assert_eq!(
            split_image_name_and_tag("nginx"),
            ("nginx".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_name_and_tag("nginx:1.25"),
            ("nginx".to_string(), "1.25".to_string())
        );
        assert_eq!(
            split_image_name_and_tag("registry:5000/team/app"),
            ("registry:5000/team/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_name_and_tag("registry:5000/team/app:v2"),
            ("registry:5000/team/app".to_string(), "v2".to_string())
        );
    }
}
