//! Platform string handling.
//!
//! Image registries and builders describe platforms as `os/arch[/variant]`
//! strings with normalized architecture names. The normalization table
//! mirrors containerd's platform database so that e.g. `x86_64` and `amd64`
//! resolve to the same base image hash.

/// Normalize an architecture / variant pair to registry conventions.
pub fn normalize_architecture(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant.to_ascii_lowercase();
    match arch.as_str() {
        "i386" => ("386".into(), String::new()),
        "x86_64" | "x86-64" | "amd64" => ("amd64".into(), String::new()),
        "aarch64" | "arm64" => {
            let variant = match variant.as_str() {
                "8" | "v8" => String::new(),
                other => other.to_string(),
            };
            ("arm64".into(), variant)
        }
        "armhf" => ("arm".into(), "v7".into()),
        "armel" => ("arm".into(), "v6".into()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_string(),
                "5" | "6" | "8" => format!("v{variant}"),
                other => other.to_string(),
            };
            ("arm".into(), variant)
        }
        _ => (arch, variant),
    }
}

/// Default platform for the local client. The OS component is always
/// `linux` since that is what container builds target regardless of the
/// host operating system.
pub fn client_platform() -> String {
    let (arch, variant) = normalize_architecture(std::env::consts::ARCH, "");
    if variant.is_empty() {
        format!("linux/{arch}")
    } else {
        format!("linux/{arch}/{variant}")
    }
}

/// Normalize a full `os/arch[/variant]` platform string.
pub fn normalize_platform(platform: &str) -> String {
    let mut parts = platform.splitn(3, '/');
    let os = parts.next().unwrap_or("linux");
    let arch = parts.next().unwrap_or("");
    let variant = parts.next().unwrap_or("");
    let (arch, variant) = normalize_architecture(arch, variant);
    if variant.is_empty() {
        format!("{os}/{arch}")
    } else {
        format!("{os}/{arch}/{variant}")
    }
}

/// Platform string rendered safe for use inside an image tag.
pub fn platform_slug(platform: &str) -> String {
    platform.replace('/', "-")
}

/// Split a platform into `(os, arch, variant)` components.
pub fn split_platform(platform: &str) -> (String, String, String) {
    let mut parts = platform.splitn(3, '/');
    (
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    )
}
