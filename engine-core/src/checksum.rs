//! Content fingerprints for intermediate images.
//!
//! A fingerprint is an opaque hex string used as the image tag; callers must
//! not parse it. Composition is order-sensitive on purpose - the inputs are
//! fed in a fixed order (dockerfile bytes, base pins, platforms) so the same
//! logical image always maps to the same tag.

/// SHA-256 of `data` as 64 lowercase hex characters.
pub fn compute_checksum(data: impl AsRef<[u8]>) -> String {
    sha256::digest(data.as_ref())
}

/// Composes already-computed checksums into one. Order matters.
pub fn sum_checksum<I, S>(sums: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut concat = String::new();
    for sum in sums {
        concat.push_str(sum.as_ref());
    }
    compute_checksum(concat.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn checksum_is_deterministic_sha256() {
        let sum = compute_checksum(b"FROM alpine:3.19\n");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sum, compute_checksum(b"FROM alpine:3.19\n"));
        // well-known vector
        assert_eq!(
            compute_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sum_checksum_is_order_sensitive() {
        let a = compute_checksum(b"a");
        let b = compute_checksum(b"b");
        assert_ne!(sum_checksum([&a, &b]), sum_checksum([&b, &a]));
        assert_eq!(sum_checksum([&a, &b]), sum_checksum([&a, &b]));
    }
}
