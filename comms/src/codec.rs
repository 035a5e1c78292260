use std::io;

/// Encodes a message into the body of a frame.
pub trait Serialize<'a> {
    /// Writes the framed representation of `self` into `buf`.
    ///
    /// Large numeric bodies are not copied into `buf`, they are returned
    /// instead so the sender can write them straight from their origin.
    ///
    /// # Arguments
    /// * `buf` - The staging buffer, positioned after the length prefix.
    ///
    /// # Returns
    /// The trailing zero-copy bytes if there are any, or an `io::Error` if
    /// the message could not be encoded.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}

/// Decodes a message borrowing from the body of a received frame.
pub trait Deserialize<'a>: Sized {
    /// # Arguments
    /// * `buf` - The whole frame body, without the length prefix.
    ///
    /// # Returns
    /// The decoded value or an `InvalidData` error for malformed bodies.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
