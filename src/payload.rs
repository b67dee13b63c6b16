use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use rand::{TryRngCore, rngs::OsRng};
use tracing::debug;

/// Terminates every synthesized record.
pub const RECORD_DELIMITER: u8 = b'\n';

/// Generate a `size`-byte payload of printable noise ending in [`RECORD_DELIMITER`].
///
/// Random bytes are base64-encoded and truncated, so content is printable.
/// If the OS entropy source fails the payload is built from zeroes instead.
pub fn synthesize(size: usize) -> Bytes {
    synthesize_from(&mut OsRng, size)
}

fn synthesize_from<R: TryRngCore>(rng: &mut R, size: usize) -> Bytes {
    if size == 0 {
        return Bytes::new();
    }
    let mut raw = vec![0u8; size];
    if let Err(e) = rng.try_fill_bytes(&mut raw) {
        debug!(error = ?e, "entropy unavailable, using zero-filled payload");
        raw.fill(0);
    }
    let mut msg = STANDARD.encode(&raw).into_bytes();
    msg.truncate(size);
    msg[size - 1] = RECORD_DELIMITER;
    Bytes::from(msg)
}
