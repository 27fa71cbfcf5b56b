use std::fmt;

/// Lazy hex dump of a received datagram, rendered only when the log line is
/// actually emitted. Shows 16 bytes per row with an ASCII gutter.
pub struct Hex<'a>(&'a [u8], usize);

impl<'a> Hex<'a>
{
    pub fn new<T>(data: &'a T, length: usize) -> Hex<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        let data = data.as_ref();
        Hex(data, length.min(data.len()))
    }
}

impl fmt::Display for Hex<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (row, chunk) in self.0[..self.1].chunks(16).enumerate()
        {
            if row > 0
            {
                write!(f, "\n")?;
            }

            write!(f, "{:04x} ", row * 16)?;

            for i in 0..16
            {
                match chunk.get(i)
                {
                    Some(byte) => write!(f, " {:02x}", byte)?,
                    None => write!(f, "   ")?
                }
            }

            write!(f, "  ")?;

            for byte in chunk
            {
                if byte.is_ascii_graphic() || *byte == b' '
                {
                    write!(f, "{}", *byte as char)?;
                }
                else
                {
                    write!(f, ".")?;
                }
            }
        }

        Ok(())
    }
}
