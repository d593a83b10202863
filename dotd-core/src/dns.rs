//! In-place editing of TCP-framed DNS messages.
//!
//! A TCP DNS message is a 16-bit big-endian length prefix followed by the
//! usual 12-byte header and the question/answer/authority/additional
//! sections. The only mutation performed here is removing EDNS padding
//! options from responses before they are re-emitted over UDP.

/// Length prefix plus DNS header.
const FRAME_HEADER_LEN: usize = 14;

/// Resource record type carrying EDNS options.
const TYPE_OPT: u16 = 41;

/// EDNS option code for padding (RFC 7830).
const OPTION_PADDING: u16 = 12;

/// A TCP-framed DNS message with editing support.
pub struct DnsPacket {
    bytes: Vec<u8>,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn write_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

impl DnsPacket {
    /// Wrap a TCP DNS message for inspection and editing.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Whether the length prefix matches the remaining bytes and the header
    /// fits.
    pub fn valid(&self) -> bool {
        self.bytes.len() >= FRAME_HEADER_LEN
            && read_u16(&self.bytes, 0) as usize == self.bytes.len() - 2
    }

    /// The DNS message without the TCP length prefix.
    pub fn data(&self) -> &[u8] {
        &self.bytes[2..]
    }

    /// Length of the unframed DNS message.
    pub fn len(&self) -> usize {
        if self.valid() {
            read_u16(&self.bytes, 0) as usize
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give the framed bytes back.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Remove every EDNS padding option from the first OPT record in the
    /// additional section, fixing up the option length, the record data
    /// length and the frame's length prefix.
    ///
    /// Returns true iff at least one padding option was removed. Anything
    /// that does not parse leaves the packet untouched.
    pub fn strip_padding(&mut self) -> bool {
        if !self.valid() {
            return false;
        }

        let queries = read_u16(&self.bytes, 6);
        let answers = read_u16(&self.bytes, 8);
        let authorities = read_u16(&self.bytes, 10);
        let mut additional = read_u16(&self.bytes, 12);

        let mut pos = FRAME_HEADER_LEN;
        pos = self.skip_queries(queries, pos);
        pos = self.skip_records(answers, pos);
        pos = self.skip_records(authorities, pos);

        while additional > 0 && pos < self.bytes.len() {
            additional -= 1;
            // An OPT record owns the root name, so it starts with a zero
            // label followed by the 16-bit type.
            if self.bytes[pos] != 0
                || self.bytes.len() - pos < 11
                || read_u16(&self.bytes, pos + 1) != TYPE_OPT
            {
                pos = self.skip_records(1, pos);
                continue;
            }

            // name(1) type(2) class(2) ttl(4) = 9 bytes before RDLENGTH.
            let rdlength_at = pos + 9;
            let rdlength = read_u16(&self.bytes, rdlength_at) as usize;
            let options_at = rdlength_at + 2;
            if self.bytes.len() - options_at < rdlength {
                return false;
            }

            let kept = Self::remove_padding_options(
                &mut self.bytes[options_at..options_at + rdlength],
            );
            let removed = rdlength - kept;
            if removed == 0 {
                return false;
            }

            write_u16(&mut self.bytes, rdlength_at, kept as u16);
            let frame_len = read_u16(&self.bytes, 0) as usize - removed;
            write_u16(&mut self.bytes, 0, frame_len as u16);
            self.bytes
                .copy_within(options_at + rdlength.., options_at + kept);
            self.bytes.truncate(self.bytes.len() - removed);
            return true;
        }

        false
    }

    /// Compact the options region in place, dropping padding options.
    /// Returns the number of bytes still in use.
    fn remove_padding_options(options: &mut [u8]) -> usize {
        let mut read = 0usize;
        let mut write = 0usize;
        while options.len() - read >= 4 {
            let code = read_u16(options, read);
            let length = read_u16(options, read + 2) as usize;
            let full = 4 + length;
            if options.len() - read < full {
                break;
            }
            if code == OPTION_PADDING {
                read += full;
            } else {
                options.copy_within(read..read + full, write);
                read += full;
                write += full;
            }
        }
        // Trailing bytes that do not form a whole option are preserved
        // untouched rather than guessed at.
        let tail = options.len() - read;
        options.copy_within(read.., write);
        write + tail
    }

    /// Skip a DNS name: a run of length-prefixed labels ended by a zero
    /// label or a 2-byte compression pointer.
    fn skip_name(&self, mut pos: usize) -> usize {
        let end = self.bytes.len();
        while pos < end {
            let label = self.bytes[pos] as usize;
            if label == 0 {
                return pos + 1;
            } else if label & 0xc0 == 0xc0 {
                return pos + 2;
            } else if end - pos > label + 1 {
                pos += label + 1;
            } else {
                return end;
            }
        }
        pos
    }

    fn skip_fixed(&self, pos: usize, length: usize) -> usize {
        if self.bytes.len() - pos > length {
            pos + length
        } else {
            self.bytes.len()
        }
    }

    fn skip_queries(&self, count: u16, mut pos: usize) -> usize {
        for _ in 0..count {
            if pos >= self.bytes.len() {
                break;
            }
            pos = self.skip_name(pos);
            pos = self.skip_fixed(pos, 4);
        }
        pos
    }

    fn skip_records(&self, count: u16, mut pos: usize) -> usize {
        for _ in 0..count {
            if pos >= self.bytes.len() {
                break;
            }
            pos = self.skip_name(pos);
            pos = self.skip_fixed(pos, 8);
            if self.bytes.len() - pos >= 2 {
                let rdlength = read_u16(&self.bytes, pos) as usize;
                pos += 2;
                if self.bytes.len() - pos >= rdlength {
                    pos += rdlength;
                } else {
                    pos = self.bytes.len();
                }
            } else {
                pos = self.bytes.len();
            }
        }
        pos
    }
}
