use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// SHA-256 of a byte slice, hex encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Generate a random unique ID for channels and other operations
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current Unix timestamp in milliseconds
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

/// Format a byte count in human-readable form
pub fn format_size(size: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < units.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, units[unit_index])
    } else {
        format!("{:.2} {}", size, units[unit_index])
    }
}

/// Final component of a peer-supplied name, so it cannot escape the target directory
pub fn base_file_name(name: &str) -> Option<String> {
    let candidate = name.rsplit(['/', '\\']).next()?;
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return None;
    }
    Path::new(candidate)
        .file_name()
        .and_then(|os_str| os_str.to_str())
        .map(String::from)
}

/// Log and report an empty required argument
pub fn check_not_empty(value: &str, name: &str) -> bool {
    if value.is_empty() {
        tracing::error!(argument = name, "argument cannot be empty");
        return false;
    }
    true
}

tokio::task_local! {
    static DISPATCH: ();
}

/// Run `future` as event-dispatch work. Blocking calls made while it is
/// being polled are refused.
pub async fn dispatch_scope<F: Future>(future: F) -> F::Output {
    DISPATCH.scope((), future).await
}

/// Whether the caller is running inside [`dispatch_scope`]
pub fn in_dispatch() -> bool {
    DISPATCH.try_with(|_| ()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_generate_id() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_base_file_name() {
        assert_eq!(base_file_name("a b.jpg").as_deref(), Some("a b.jpg"));
        assert_eq!(base_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(base_file_name("dir\\x.txt").as_deref(), Some("x.txt"));
        assert_eq!(base_file_name(".."), None);
        assert_eq!(base_file_name("trailing/"), None);
        assert_eq!(base_file_name(""), None);
    }

    #[tokio::test]
    async fn test_dispatch_scope() {
        assert!(!in_dispatch());
        assert!(dispatch_scope(async { in_dispatch() }).await);

        // Scope does not leak into spawned work
        let spawned = dispatch_scope(async { tokio::spawn(async { in_dispatch() }).await })
            .await
            .unwrap();
        assert!(!spawned);
        assert!(!in_dispatch());
    }
}
