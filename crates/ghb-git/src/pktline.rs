//! Git pkt-line framing and side-band multiplexing.
//!
//! Every smart HTTP message is a sequence of pkt-lines: a 4-character hex
//! length (covering the header itself) followed by the payload, or one of
//! the special packets `0000` (flush), `0001` (delimiter) and `0002`
//! (response end).

use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest total length of a single pkt-line, header included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest payload a single pkt-line can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    ///
    /// Fails with [`GitError::Length`] when the payload does not fit in one
    /// pkt-line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => {
                if data.len() > MAX_PAYLOAD_LEN {
                    return Err(GitError::Length(data.len()));
                }
                let mut result = Vec::with_capacity(data.len() + 4);
                result.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
                result.extend_from_slice(data);
                Ok(result)
            }
            Self::Flush => Ok(b"0000".to_vec()),
            Self::Delimiter => Ok(b"0001".to_vec()),
            Self::ResponseEnd => Ok(b"0002".to_vec()),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or `None` at a clean end of input.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.fill(&mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(GitError::Framing(format!(
                    "truncated length header ({} of 4 bytes)",
                    n
                )))
            }
        }

        match &len_buf {
            b"0000" => Ok(Some(PktLine::Flush)),
            b"0001" => Ok(Some(PktLine::Delimiter)),
            b"0002" => Ok(Some(PktLine::ResponseEnd)),
            _ => {
                if !len_buf.iter().all(u8::is_ascii_hexdigit) {
                    return Err(GitError::Framing(format!(
                        "invalid length header {:?}",
                        String::from_utf8_lossy(&len_buf)
                    )));
                }
                let len = len_buf
                    .iter()
                    .fold(0usize, |acc, &b| (acc << 4) | hex_value(b) as usize);

                if len < 4 {
                    return Err(GitError::Framing(format!("length {} is too small", len)));
                }
                if len > MAX_PKT_LEN {
                    return Err(GitError::Length(len - 4));
                }

                let mut data = vec![0u8; len - 4];
                let read = self.fill(&mut data)?;
                if read != data.len() {
                    return Err(GitError::Framing(format!(
                        "truncated payload ({} of {} bytes)",
                        read,
                        data.len()
                    )));
                }

                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads into `buf` until it is full or the input ends.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Iterates over the packets of the current section.
    ///
    /// The iterator ends at the next flush packet (which is consumed but not
    /// yielded) or at the end of input. Calling `frames` again continues with
    /// the following section.
    pub fn frames(&mut self) -> Frames<'_, R> {
        Frames {
            reader: self,
            done: false,
        }
    }

    /// Reads all packets until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        self.frames().collect()
    }

    /// Reads a side-band multiplexed section up to its flush packet.
    ///
    /// Fails with [`GitError::Protocol`] when the remote reports an error on
    /// the error band.
    pub fn read_sideband(&mut self) -> Result<Demuxed> {
        let mut out = Demuxed::default();
        for pkt in self.frames() {
            let pkt = pkt?;
            let Some((&band, payload)) = pkt.data().and_then(|d| d.split_first()) else {
                continue;
            };
            match Band::from_byte(band) {
                Some(Band::Data) => out.data.extend_from_slice(payload),
                Some(Band::Progress) => out.progress.extend_from_slice(payload),
                Some(Band::Error) => {
                    return Err(GitError::Protocol(
                        String::from_utf8_lossy(payload).trim_end().to_string(),
                    ))
                }
                None => {
                    return Err(GitError::Framing(format!("unknown side-band {}", band)));
                }
            }
        }
        Ok(out)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Lazy iterator over the packets of one flush-terminated section.
pub struct Frames<'a, R> {
    reader: &'a mut PktLineReader<R>,
    done: bool,
}

impl<R: Read> Iterator for Frames<'_, R> {
    type Item = Result<PktLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read() {
            Ok(Some(PktLine::Flush)) | Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(pkt)) => Some(Ok(pkt)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Side-band channel of a multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Pack data.
    Data = 1,
    /// Human-readable progress messages.
    Progress = 2,
    /// Fatal error message.
    Error = 3,
}

impl Band {
    /// Parses a band number.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Side-band flavour negotiated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sideband {
    /// `side-band`: 1000-byte packets.
    Basic,
    /// `side-band-64k`: full-size packets.
    Large,
}

impl Sideband {
    /// Largest payload one side-band packet carries, excluding the band byte.
    pub fn max_chunk(self) -> usize {
        match self {
            Self::Basic => 1000 - 5,
            Self::Large => MAX_PAYLOAD_LEN - 1,
        }
    }
}

/// Demultiplexed side-band content.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    /// Concatenated band 1 payloads.
    pub data: Vec<u8>,
    /// Concatenated band 2 payloads.
    pub progress: Vec<u8>,
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes `data` on `band`, split into as many packets as needed.
    pub fn write_band(&mut self, mode: Sideband, band: Band, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(mode.max_chunk()) {
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(band as u8);
            payload.extend_from_slice(chunk);
            self.write(&PktLine::Data(payload))?;
        }
        Ok(())
    }

    /// Writes raw bytes outside of pkt-line framing.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> PktLineReader<Cursor<Vec<u8>>> {
        PktLineReader::new(Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode().unwrap(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
        assert_eq!(PktLine::Delimiter.encode().unwrap(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode().unwrap(), b"0002");
    }

    #[test]
    fn test_pktline_empty_data() {
        let encoded = PktLine::from_bytes(Vec::new()).encode().unwrap();
        assert_eq!(encoded, b"0004");
        assert_eq!(reader(&encoded).read().unwrap(), Some(PktLine::Data(Vec::new())));
    }

    #[test]
    fn test_pktline_max_payload() {
        let pkt = PktLine::from_bytes(vec![b'x'; MAX_PAYLOAD_LEN]);
        let encoded = pkt.encode().unwrap();
        assert_eq!(&encoded[..4], b"fff0");

        let read = reader(&encoded).read().unwrap().unwrap();
        assert_eq!(read.data().unwrap().len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_pktline_oversized_payload() {
        let pkt = PktLine::from_bytes(vec![b'x'; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(pkt.encode(), Err(GitError::Length(65517))));

        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        assert!(matches!(
            writer.write(&pkt),
            Err(GitError::Length(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pktline_read_declared_too_long() {
        assert!(matches!(reader(b"fff1").read(), Err(GitError::Length(_))));
    }

    #[test]
    fn test_pktline_read_invalid_length() {
        assert!(matches!(reader(b"0003").read(), Err(GitError::Framing(_))));
        assert!(matches!(reader(b"00zz").read(), Err(GitError::Framing(_))));
        assert!(matches!(reader(b"+004").read(), Err(GitError::Framing(_))));
    }

    #[test]
    fn test_pktline_truncated() {
        assert!(matches!(reader(b"00").read(), Err(GitError::Framing(_))));
        assert!(matches!(reader(b"000ahel").read(), Err(GitError::Framing(_))));
    }

    #[test]
    fn test_pktline_read_eof_on_empty() {
        assert!(reader(b"").read().unwrap().is_none());
    }

    #[test]
    fn test_pktline_special_packets() {
        let mut r = reader(b"000000010002");
        assert_eq!(r.read().unwrap(), Some(PktLine::Flush));
        assert_eq!(r.read().unwrap(), Some(PktLine::Delimiter));
        assert_eq!(r.read().unwrap(), Some(PktLine::ResponseEnd));
        assert_eq!(r.read().unwrap(), None);
    }

    #[test]
    fn test_pktline_as_str() {
        assert_eq!(PktLine::from_string("hello\n").as_str(), Some("hello"));
        assert_eq!(PktLine::from_string("no newline").as_str(), Some("no newline"));
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
        assert!(PktLine::Flush.as_str().is_none());
    }

    #[test]
    fn test_frames_are_sectioned() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("line1").unwrap();
            writer.write_line("line2").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("line3").unwrap();
        }

        let mut r = reader(&buf);
        let first: Vec<_> = r.frames().collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].as_str(), Some("line2"));

        let second = r.read_until_flush().unwrap();
        assert_eq!(second, vec![PktLine::from_string("line3\n")]);
        assert!(r.frames().next().is_none());
    }

    #[test]
    fn test_frames_stop_after_error() {
        let mut r = reader(b"0009test\n0003");
        let mut frames = r.frames();
        assert!(frames.next().unwrap().is_ok());
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_writer_write_line_adds_newline_once() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("test").unwrap();
            writer.write_line("test\n").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(buf, b"0009test\n0009test\n");
    }

    #[test]
    fn test_sideband_chunking() {
        let data = vec![7u8; 2500];
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_band(Sideband::Basic, Band::Data, &data).unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut r = reader(&buf);
        let packets = r.read_until_flush().unwrap();
        assert_eq!(packets.len(), 3);
        for pkt in &packets {
            let payload = pkt.data().unwrap();
            assert_eq!(payload[0], Band::Data as u8);
            assert!(payload.len() + 4 <= 1000);
        }

        let demuxed = reader(&buf).read_sideband().unwrap();
        assert_eq!(demuxed.data, data);
        assert!(demuxed.progress.is_empty());
    }

    #[test]
    fn test_sideband_large_chunk_size() {
        assert_eq!(Sideband::Large.max_chunk(), 65515);
        assert_eq!(Sideband::Basic.max_chunk(), 995);
    }

    #[test]
    fn test_sideband_progress_and_error() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_band(Sideband::Large, Band::Progress, b"counting\n").unwrap();
            writer.write_band(Sideband::Large, Band::Data, b"PACK").unwrap();
            writer.write_band(Sideband::Large, Band::Error, b"boom\n").unwrap();
            writer.flush_pkt().unwrap();
        }

        let result = reader(&buf).read_sideband();
        match result {
            Err(GitError::Protocol(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_band_from_byte() {
        assert_eq!(Band::from_byte(1), Some(Band::Data));
        assert_eq!(Band::from_byte(3), Some(Band::Error));
        assert_eq!(Band::from_byte(4), None);
    }

    proptest! {
        #[test]
        fn prop_data_lines_roundtrip(lines in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..2048), 0..16)) {
            let mut buf = Vec::new();
            {
                let mut writer = PktLineWriter::new(&mut buf);
                for line in &lines {
                    writer.write_data(line).unwrap();
                }
                writer.flush_pkt().unwrap();
            }

            let packets = reader(&buf).read_until_flush().unwrap();
            let decoded: Vec<Vec<u8>> = packets.iter().map(|p| p.data().unwrap().to_vec()).collect();
            prop_assert_eq!(decoded, lines);
        }

        #[test]
        fn prop_sideband_roundtrip(data in prop::collection::vec(any::<u8>(), 0..5000)) {
            let mut buf = Vec::new();
            {
                let mut writer = PktLineWriter::new(&mut buf);
                writer.write_band(Sideband::Basic, Band::Data, &data).unwrap();
                writer.flush_pkt().unwrap();
            }
            prop_assert_eq!(reader(&buf).read_sideband().unwrap().data, data);
        }

        #[test]
        fn prop_reader_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut r = reader(&bytes);
            for _ in 0..64 {
                match r.read() {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}
