//! DNS message encoding and decoding (RFC 1035).
//!
//! Covers what a stub resolver needs: the header, questions, resource
//! headers, A and AAAA data, and skipping anything else. [`MessageBuilder`]
//! compresses names it has already written. [`Parser`] walks a message
//! section by section; an answer header may be peeked any number of times
//! before its data is consumed.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;

pub const CLASS_INET: u16 = 1;

const HEADER_LEN: usize = 12;
const MAX_NAME_WIRE_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
/// Compression pointers followed while reading one name.
const MAX_POINTERS: usize = 10;
/// Offsets above this cannot be the target of a compression pointer.
const MAX_POINTER_OFFSET: usize = 0x3fff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("insufficient data for the message")]
    Short,
    #[error("parsing/packing of this section has completed")]
    SectionDone,
    #[error("sections must be written in order")]
    SectionOrder,
    #[error("invalid label in name {0:?}")]
    Label(String),
    #[error("name too long")]
    NameTooLong,
    #[error("too many compression pointers")]
    TooManyPointers,
    #[error("reserved label prefix")]
    ReservedPrefix,
    #[error("resource type {0} does not match")]
    WrongType(u16),
    #[error("invalid resource data length {0}")]
    ResourceLength(u16),
    #[error("too many records in a section")]
    TooManyRecords,
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RCode(pub u8);

impl RCode {
    pub const SUCCESS: Self = Self(0);
    pub const FORMAT_ERROR: Self = Self(1);
    pub const SERVER_FAILURE: Self = Self(2);
    pub const NAME_ERROR: Self = Self(3);
    pub const NOT_IMPLEMENTED: Self = Self(4);
    pub const REFUSED: Self = Self(5);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: RCode,
}

impl Header {
    fn flags(&self) -> u16 {
        let mut flags = u16::from(self.opcode & 0x0f) << 11 | u16::from(self.rcode.0 & 0x0f);
        if self.response {
            flags |= 1 << 15;
        }
        if self.authoritative {
            flags |= 1 << 10;
        }
        if self.truncated {
            flags |= 1 << 9;
        }
        if self.recursion_desired {
            flags |= 1 << 8;
        }
        if self.recursion_available {
            flags |= 1 << 7;
        }
        flags
    }

    fn from_flags(id: u16, flags: u16) -> Self {
        Self {
            id,
            response: flags & (1 << 15) != 0,
            opcode: ((flags >> 11) & 0x0f) as u8,
            authoritative: flags & (1 << 10) != 0,
            truncated: flags & (1 << 9) != 0,
            recursion_desired: flags & (1 << 8) != 0,
            recursion_available: flags & (1 << 7) != 0,
            rcode: RCode((flags & 0x0f) as u8),
        }
    }
}

/// A question. Names are kept in dotted form with a trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: u16) -> Self {
        Self {
            name: name.into(),
            qtype,
            qclass: CLASS_INET,
        }
    }

    /// Same type and class, and names equal ignoring ASCII case.
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHeader {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub length: u16,
}

// ── Building ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Questions,
    Answers,
}

/// Writes a message section by section.
pub struct MessageBuilder {
    buf: Vec<u8>,
    header: Header,
    questions: u16,
    answers: u16,
    section: Section,
    compression: HashMap<String, usize>,
}

impl MessageBuilder {
    pub fn new(header: Header) -> Self {
        Self {
            buf: vec![0; HEADER_LEN],
            header,
            questions: 0,
            answers: 0,
            section: Section::Questions,
            compression: HashMap::new(),
        }
    }

    pub fn question(&mut self, q: &Question) -> MessageResult<()> {
        if self.section > Section::Questions {
            return Err(MessageError::SectionOrder);
        }
        if self.questions == u16::MAX {
            return Err(MessageError::TooManyRecords);
        }
        self.push_name(&q.name)?;
        self.buf.extend_from_slice(&q.qtype.to_be_bytes());
        self.buf.extend_from_slice(&q.qclass.to_be_bytes());
        self.questions += 1;
        Ok(())
    }

    /// Append an answer record with raw data.
    pub fn resource(&mut self, name: &str, rtype: u16, ttl: u32, data: &[u8]) -> MessageResult<()> {
        let length = u16::try_from(data.len()).map_err(|_| MessageError::ResourceLength(u16::MAX))?;
        if self.answers == u16::MAX {
            return Err(MessageError::TooManyRecords);
        }
        self.push_name(name)?;
        self.buf.extend_from_slice(&rtype.to_be_bytes());
        self.buf.extend_from_slice(&CLASS_INET.to_be_bytes());
        self.buf.extend_from_slice(&ttl.to_be_bytes());
        self.buf.extend_from_slice(&length.to_be_bytes());
        self.buf.extend_from_slice(data);
        self.section = Section::Answers;
        self.answers += 1;
        Ok(())
    }

    pub fn a_resource(&mut self, name: &str, ttl: u32, ip: Ipv4Addr) -> MessageResult<()> {
        self.resource(name, TYPE_A, ttl, &ip.octets())
    }

    pub fn aaaa_resource(&mut self, name: &str, ttl: u32, ip: Ipv6Addr) -> MessageResult<()> {
        self.resource(name, TYPE_AAAA, ttl, &ip.octets())
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf[0..2].copy_from_slice(&self.header.id.to_be_bytes());
        self.buf[2..4].copy_from_slice(&self.header.flags().to_be_bytes());
        self.buf[4..6].copy_from_slice(&self.questions.to_be_bytes());
        self.buf[6..8].copy_from_slice(&self.answers.to_be_bytes());
        self.buf
    }

    fn push_name(&mut self, name: &str) -> MessageResult<()> {
        let labels = split_labels(name)?;
        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(&offset) = self.compression.get(&suffix) {
                let pointer = 0xc000 | offset as u16;
                self.buf.extend_from_slice(&pointer.to_be_bytes());
                return Ok(());
            }
            if self.buf.len() <= MAX_POINTER_OFFSET {
                self.compression.insert(suffix, self.buf.len());
            }
            let label = labels[i];
            self.buf.push(label.len() as u8);
            self.buf.extend_from_slice(label.as_bytes());
        }
        self.buf.push(0);
        Ok(())
    }
}

/// Split a dotted name into labels, checking the wire limits. A single
/// trailing dot is optional; `.` alone is the root.
fn split_labels(name: &str) -> MessageResult<Vec<&str>> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let labels: Vec<&str> = trimmed.split('.').collect();
    let mut wire_len = 1;
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(MessageError::Label(name.to_string()));
        }
        wire_len += label.len() + 1;
    }
    if wire_len > MAX_NAME_WIRE_LEN {
        return Err(MessageError::NameTooLong);
    }
    Ok(labels)
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Cursor over a received message.
#[derive(Debug, Clone)]
pub struct Parser {
    msg: Vec<u8>,
    off: usize,
    questions_left: u16,
    answers_left: u16,
    /// Answer header already read, with the end offset of its data.
    pending: Option<(ResourceHeader, usize)>,
}

impl Parser {
    /// Parse the header and position the cursor at the first question.
    pub fn start(msg: Vec<u8>) -> MessageResult<(Self, Header)> {
        if msg.len() < HEADER_LEN {
            return Err(MessageError::Short);
        }
        let id = read_u16(&msg, 0)?;
        let header = Header::from_flags(id, read_u16(&msg, 2)?);
        let questions_left = read_u16(&msg, 4)?;
        let answers_left = read_u16(&msg, 6)?;
        let parser = Self {
            msg,
            off: HEADER_LEN,
            questions_left,
            answers_left,
            pending: None,
        };
        Ok((parser, header))
    }

    /// The next question, or [`MessageError::SectionDone`] when none are
    /// left.
    pub fn question(&mut self) -> MessageResult<Question> {
        if self.questions_left == 0 {
            return Err(MessageError::SectionDone);
        }
        let (name, off) = read_name(&self.msg, self.off)?;
        let qtype = read_u16(&self.msg, off)?;
        let qclass = read_u16(&self.msg, off + 2)?;
        self.off = off + 4;
        self.questions_left -= 1;
        Ok(Question {
            name,
            qtype,
            qclass,
        })
    }

    pub fn skip_all_questions(&mut self) -> MessageResult<()> {
        loop {
            match self.question() {
                Ok(_) => {}
                Err(MessageError::SectionDone) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Header of the current answer. Repeated calls return the same header
    /// until its data is consumed by [`skip_answer`](Self::skip_answer),
    /// [`a_resource`](Self::a_resource) or
    /// [`aaaa_resource`](Self::aaaa_resource).
    pub fn answer_header(&mut self) -> MessageResult<ResourceHeader> {
        if let Some((header, _)) = &self.pending {
            return Ok(header.clone());
        }
        self.skip_all_questions()?;
        if self.answers_left == 0 {
            return Err(MessageError::SectionDone);
        }
        let (name, off) = read_name(&self.msg, self.off)?;
        let rtype = read_u16(&self.msg, off)?;
        let class = read_u16(&self.msg, off + 2)?;
        let ttl = u32::from(read_u16(&self.msg, off + 4)?) << 16 | u32::from(read_u16(&self.msg, off + 6)?);
        let length = read_u16(&self.msg, off + 8)?;
        let data = off + 10;
        let end = data + usize::from(length);
        if end > self.msg.len() {
            return Err(MessageError::Short);
        }
        let header = ResourceHeader {
            name,
            rtype,
            class,
            ttl,
            length,
        };
        self.off = data;
        self.pending = Some((header.clone(), end));
        Ok(header)
    }

    pub fn skip_answer(&mut self) -> MessageResult<()> {
        self.answer_header()?;
        self.consume();
        Ok(())
    }

    pub fn a_resource(&mut self) -> MessageResult<Ipv4Addr> {
        let data = self.resource_data(TYPE_A, 4)?;
        Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
    }

    pub fn aaaa_resource(&mut self) -> MessageResult<Ipv6Addr> {
        let data = self.resource_data(TYPE_AAAA, 16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data);
        Ok(Ipv6Addr::from(octets))
    }

    fn resource_data(&mut self, rtype: u16, len: usize) -> MessageResult<Vec<u8>> {
        let header = self.answer_header()?;
        if header.rtype != rtype {
            return Err(MessageError::WrongType(header.rtype));
        }
        if usize::from(header.length) != len {
            return Err(MessageError::ResourceLength(header.length));
        }
        let data = self.msg[self.off..self.off + len].to_vec();
        self.consume();
        Ok(data)
    }

    fn consume(&mut self) {
        if let Some((_, end)) = self.pending.take() {
            self.off = end;
            self.answers_left -= 1;
        }
    }
}

fn read_u16(msg: &[u8], off: usize) -> MessageResult<u16> {
    match msg.get(off..off + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(MessageError::Short),
    }
}

/// Read a possibly compressed name at `off`. Returns the dotted name and
/// the offset just past it in the original position.
fn read_name(msg: &[u8], mut off: usize) -> MessageResult<(String, usize)> {
    let mut name = String::new();
    let mut wire_len = 1;
    let mut pointers = 0;
    let mut resume = None;

    loop {
        let len = *msg.get(off).ok_or(MessageError::Short)?;
        match len & 0xc0 {
            0x00 => {
                if len == 0 {
                    off += 1;
                    break;
                }
                let len = usize::from(len);
                let label = msg.get(off + 1..off + 1 + len).ok_or(MessageError::Short)?;
                wire_len += len + 1;
                if wire_len > MAX_NAME_WIRE_LEN {
                    return Err(MessageError::NameTooLong);
                }
                name.extend(label.iter().map(|&b| char::from(b)));
                name.push('.');
                off += 1 + len;
            }
            0xc0 => {
                let low = *msg.get(off + 1).ok_or(MessageError::Short)?;
                if resume.is_none() {
                    resume = Some(off + 2);
                }
                pointers += 1;
                if pointers > MAX_POINTERS {
                    return Err(MessageError::TooManyPointers);
                }
                off = usize::from(len & 0x3f) << 8 | usize::from(low);
            }
            _ => return Err(MessageError::ReservedPrefix),
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, resume.unwrap_or(off)))
}
