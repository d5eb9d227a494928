//! Lossy UTF-16 -> ASCII conversion for loader-supplied module basenames.
//!
//! Windows `UNICODE_STRING` buffers are UTF-16; the trace log and `Module`
//! names are plain ASCII, so this is a one-way, information-losing
//! conversion: any code unit outside the Latin-1 low byte becomes `?`.

/// Converts `source` (UTF-16 code units, no terminator) into an ASCII
/// buffer of exactly `destination_size` bytes, null-terminated.
///
/// Code units with a non-zero high byte become `?`. At most
/// `destination_size - 1` code units are converted; the remainder of the
/// buffer (including the terminator) is zero. Passing `destination_size ==
/// 0` yields an empty buffer.
pub fn utf16_to_ascii(source: &[u16], destination_size: usize) -> Vec<u8> {
    let mut dest = vec![0u8; destination_size];
    if destination_size == 0 {
        return dest;
    }

    let convertible = destination_size - 1;
    let n = source.len().min(convertible);
    for (i, &uc) in source.iter().take(n).enumerate() {
        dest[i] = if uc & 0xFF00 == 0 { (uc & 0xFF) as u8 } else { b'?' };
    }
    // dest[n..] is already zero, including the terminator at destination_size - 1.
    dest
}
