/*
                                1  1  1  1  1  1
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      ID                       |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    QDCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ANCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    NSCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ARCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
 */

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bits::complete::take,
    combinator::map,
    error::ErrorKind,
    multi::{length_data, many_m_n},
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
};
use thiserror::Error;

pub const DNS_HDR_SIZE: usize = 12;

/// Largest label, in octets.
const MAX_LABEL_LEN: usize = 63;

/// Largest encoded name, in octets.
const MAX_NAME_LEN: usize = 255;

/// Compression pointers followed before a name is considered looping.
const MAX_POINTERS: usize = 16;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    pub qr: u8,
    pub opcode: u8,
    pub aa: u8,
    pub tc: u8,
    pub rd: u8,
    pub ra: u8,
    pub rcode: u8,
}

impl Flags {
    /// Flags of a standard recursive query.
    pub fn query() -> Self {
        Flags {
            opcode: OpCode::QUERY as u8,
            rd: 1,
            ..Default::default()
        }
    }

    pub fn compress_u16(&self) -> u16 {
        let flags_h: u8 =
            (self.qr << 7) | (self.opcode << 3) | (self.aa << 2) | (self.tc << 1) | self.rd;
        let flags_l: u8 = (self.ra << 7) | (self.rcode);

        (flags_h as u16) << 8 | (flags_l as u16)
    }

    fn parse_flags(input: (&[u8], usize)) -> nom::IResult<(&[u8], usize), Flags> {
        map(
            tuple((
                take(1u8),
                take(4u8),
                take(1u8),
                take(1u8),
                take(1u8),
                take(1u8),
                take(3u8),
                take(4u8),
            )),
            |(qr, opcode, aa, tc, rd, ra, _, rcode): (u8, u8, u8, u8, u8, u8, u8, u8)| Flags {
                qr,
                opcode,
                aa,
                tc,
                rd,
                ra,
                rcode,
            },
        )(input)
    }
}

#[repr(u8)]
pub enum OpCode {
    QUERY = 0,
}

#[repr(u8)]
pub enum RCode {
    OK = 0,
    #[cfg_attr(not(test), allow(dead_code))]
    NameError = 3,
}

#[derive(Debug)]
pub struct DNSHdr<'a> {
    pub id: u16,
    pub flags: Flags,
    pub nscount: u16,
    pub arcount: u16,
    pub queries: Vec<Query<'a>>,
    pub answers: Vec<Answer<'a>>,
}

impl<'a> DNSHdr<'a> {
    pub fn new(id: u16, flags: Flags, queries: Vec<Query<'a>>, answers: Vec<Answer<'a>>) -> Self {
        DNSHdr {
            id,
            flags,
            nscount: 0,
            arcount: 0,
            queries,
            answers,
        }
    }

    /// A recursive query message carrying a single question.
    pub fn query(id: u16, question: Query<'a>) -> Self {
        Self::new(id, Flags::query(), vec![question], vec![])
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf: BytesMut = BytesMut::with_capacity(DNS_HDR_SIZE);

        buf.put_u16(self.id);
        buf.put_u16(self.flags.compress_u16());
        buf.put_u16(self.queries.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);

        for q in self.queries.iter() {
            q.to_bytes(&mut buf);
        }

        for a in self.answers.iter() {
            a.to_bytes(&mut buf);
        }

        buf.freeze()
    }

    /// Parses header, question and answer sections of a whole message.
    ///
    /// Names may use compression pointers into `buf`. Authority and
    /// additional sections are left unparsed in the returned remainder.
    pub fn from_bytes(buf: &'a [u8]) -> nom::IResult<&'a [u8], Self> {
        let (rest, (id, flags, qdcount, ancount, nscount, arcount)) = tuple((
            be_u16,
            nom::bits::bits(Flags::parse_flags),
            be_u16,
            be_u16,
            be_u16,
            be_u16,
        ))(buf)?;

        let (rest, queries) = Query::from_bytes(buf, rest, qdcount as usize)?;
        let (rest, answers) = Answer::from_bytes(buf, rest, ancount as usize)?;

        Ok((
            rest,
            DNSHdr {
                id,
                flags,
                nscount,
                arcount,
                queries,
                answers,
            },
        ))
    }

    /// Reads only the message id, for cheap filtering of stray datagrams.
    pub fn peek_id(buf: &[u8]) -> Option<u16> {
        be_u16::<_, nom::error::Error<&[u8]>>(buf)
            .ok()
            .map(|(_, id)| id)
    }
}

/*
1  1  1  1  1  1
0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                                               |
/                     QNAME                     /
/                                               /
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     QTYPE                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     QCLASS                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/
#[derive(Debug, Clone)]
pub struct Query<'a> {
    pub name: Vec<&'a [u8]>,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("empty label in {0:?}")]
    EmptyLabel(String),
    #[error("label longer than 63 octets in {0:?}")]
    LongLabel(String),
    #[error("name longer than 255 octets: {0:?}")]
    LongName(String),
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RRType {
    A = 1,      // Host Address
    NS = 2,     // an authoritative name server
    CNAME = 5,  // the canonical name for an alias
    SOA = 6,    // marks the start of a zone of authority
    PTR = 12,   // a domain name pointer
    MX = 15,    // mail exchange
    TXT = 16,   // text strings
    AAAA = 28,  // IPv6 host address
    SRV = 33,   // service location
    ANY = 255,  // all records
}

impl RRType {
    pub const ALL: [RRType; 10] = [
        RRType::A,
        RRType::AAAA,
        RRType::CNAME,
        RRType::MX,
        RRType::NS,
        RRType::PTR,
        RRType::SOA,
        RRType::SRV,
        RRType::TXT,
        RRType::ANY,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            RRType::A => "A",
            RRType::NS => "NS",
            RRType::CNAME => "CNAME",
            RRType::SOA => "SOA",
            RRType::PTR => "PTR",
            RRType::MX => "MX",
            RRType::TXT => "TXT",
            RRType::AAAA => "AAAA",
            RRType::SRV => "SRV",
            RRType::ANY => "ANY",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown record type: {0}")]
pub struct UnknownRecordType(pub String);

impl FromStr for RRType {
    type Err = UnknownRecordType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RRType::ALL
            .into_iter()
            .find(|t| t.mnemonic().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownRecordType(s.to_string()))
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RRClass {
    IN = 1, // the Internet
}

/// Parses a possibly compressed name starting at `input`.
///
/// Pointers are resolved against the whole message `msg`. The remainder
/// returned is the input right after the name as it appears in place, i.e.
/// after the first pointer if there was one.
fn parse_name<'a>(msg: &'a [u8], input: &'a [u8]) -> nom::IResult<&'a [u8], Vec<&'a [u8]>> {
    let mut labels = Vec::new();
    let mut rest = input;
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let (after, len) = be_u8(rest)?;
        match len {
            0 => return Ok((resume.unwrap_or(after), labels)),
            l if l & 0b1100_0000 == 0b1100_0000 => {
                let (after, low) = be_u8(after)?;
                let offset = (((l & 0b0011_1111) as usize) << 8) | low as usize;
                jumps += 1;
                if jumps > MAX_POINTERS || offset >= msg.len() {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        rest,
                        ErrorKind::Verify,
                    )));
                }
                resume.get_or_insert(after);
                rest = &msg[offset..];
            }
            l if l & 0b1100_0000 != 0 => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    rest,
                    ErrorKind::Tag,
                )));
            }
            l => {
                let (after, label) = nom::bytes::complete::take(l as usize)(after)?;
                labels.push(label);
                rest = after;
            }
        }
    }
}

impl<'a> Query<'a> {
    /// Builds a question for a dotted domain name. A trailing dot is allowed.
    pub fn new(domain: &'a str, qtype: RRType, qclass: RRClass) -> Result<Self, NameError> {
        let trimmed = domain.strip_suffix('.').unwrap_or(domain);
        let mut name = Vec::new();
        let mut wire_len = 1;

        if !trimmed.is_empty() {
            for label in trimmed.split('.') {
                if label.is_empty() {
                    return Err(NameError::EmptyLabel(domain.to_string()));
                }
                if label.len() > MAX_LABEL_LEN {
                    return Err(NameError::LongLabel(domain.to_string()));
                }
                wire_len += label.len() + 1;
                name.push(label.as_bytes());
            }
        }
        if wire_len > MAX_NAME_LEN {
            return Err(NameError::LongName(domain.to_string()));
        }

        Ok(Query {
            name,
            qtype: qtype as u16,
            qclass: qclass as u16,
        })
    }

    pub fn from_bytes(
        msg: &'a [u8],
        buf: &'a [u8],
        n: usize,
    ) -> nom::IResult<&'a [u8], Vec<Self>> {
        let (rest, queries) = many_m_n(
            n,
            n,
            map(
                tuple((|i: &'a [u8]| parse_name(msg, i), be_u16, be_u16)),
                |(labels, qtype, qclass)| Query {
                    name: labels,
                    qtype,
                    qclass,
                },
            ),
        )(buf)?;

        Ok((rest, queries))
    }

    pub fn to_bytes(&self, buf: &mut BytesMut) {
        self.name.iter().for_each(|&l| {
            buf.put_u8(l.len() as u8);
            buf.extend_from_slice(l);
        });
        buf.put_u8(0);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }

    /// Whether `other` asks the same question, comparing names ASCII
    /// case-insensitively.
    pub fn matches(&self, other: &Query<'_>) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.len() == other.name.len()
            && self
                .name
                .iter()
                .zip(other.name.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    #[cfg(test)]
    pub fn domain(&self) -> String {
        self.name
            .iter()
            .filter_map(|l| std::str::from_utf8(l).ok())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/*
0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                                               |
/                                               /
/                      NAME                     /
|                                               |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      TYPE                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                     CLASS                     |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      TTL                      |
|                                               |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                   RDLENGTH                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
/                     RDATA                     /
/                                               /
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/
#[derive(Debug, Clone)]
pub struct Answer<'a> {
    name: Vec<&'a [u8]>,
    pub qtype: u16,
    pub qclass: u16,
    pub ttl: u32,
    rddata: &'a [u8],
}

impl<'a> Answer<'a> {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(
        name: Vec<&'a [u8]>,
        qtype: RRType,
        qclass: RRClass,
        ttl: u32,
        data: &'a [u8],
    ) -> Self {
        Answer {
            name,
            qtype: qtype as u16,
            qclass: qclass as u16,
            ttl,
            rddata: data,
        }
    }

    pub fn from_bytes(
        msg: &'a [u8],
        buf: &'a [u8],
        n: usize,
    ) -> nom::IResult<&'a [u8], Vec<Self>> {
        let (rest, responses) = many_m_n(
            n,
            n,
            map(
                tuple((
                    |i: &'a [u8]| parse_name(msg, i),
                    be_u16,
                    be_u16,
                    be_u32,
                    length_data(be_u16),
                )),
                |(labels, qtype, qclass, ttl, rddata)| Answer {
                    name: labels,
                    qtype,
                    qclass,
                    ttl,
                    rddata,
                },
            ),
        )(buf)?;

        Ok((rest, responses))
    }

    pub fn to_bytes(&self, buf: &mut BytesMut) {
        self.name.iter().for_each(|&l| {
            buf.put_u8(l.len() as u8);
            buf.extend_from_slice(l);
        });
        buf.put_u8(0);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rddata.len() as u16);
        buf.extend(self.rddata);
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn data(&self) -> &'a [u8] {
        self.rddata
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use anyhow::Result;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_encoding() {
        let flags = Flags {
            qr: 1,
            ..Flags::query()
        };
        let answer = DNSHdr::new(12345, flags, vec![], vec![]);

        assert_eq!(answer.id, 12345);
        assert_eq!(answer.flags.qr, 1);

        let bytes = answer.to_bytes();
        assert_eq!(&bytes[..], &[0x30, 0x39, 0x81, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_query_encode() -> Result<()> {
        let q = Query::new("example.com.", RRType::MX, RRClass::IN)?;
        let bytes = DNSHdr::query(0xbeef, q).to_bytes();

        assert_eq!(&bytes[..4], &[0xbe, 0xef, 0x01, 0x00]);
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(
            &bytes[DNS_HDR_SIZE..],
            b"\x07example\x03com\x00\x00\x0f\x00\x01"
        );
        Ok(())
    }

    #[test]
    fn test_query_decode() -> Result<()> {
        // two questions, the second one compressed against the first
        let buf = &[
            212, 158, 1, 0, 0, 2, 0, 0, 0, 0, 0, 0, 3, 97, 98, 99, 17, 108, 111, 110, 103, 97, 115,
            115, 100, 111, 109, 97, 105, 110, 110, 97, 109, 101, 3, 99, 111, 109, 0, 0, 1, 0, 1, 3,
            100, 101, 102, 192, 16, 0, 1, 0, 1,
        ];

        let (rest, hdr) = DNSHdr::from_bytes(buf)?;
        assert!(rest.is_empty());
        assert_eq!(hdr.id, 0xd49e);
        assert_eq!(hdr.flags.rd, 1);
        assert_eq!(hdr.queries.len(), 2);

        assert_eq!(hdr.queries[0].domain(), "abc.longassdomainname.com");
        assert_eq!(hdr.queries[1].domain(), "def.longassdomainname.com");
        assert_eq!(hdr.queries[1].qclass, RRClass::IN as u16);
        assert_eq!(hdr.queries[1].qtype, RRType::A as u16);

        Ok(())
    }

    #[test]
    fn test_answer_decode() -> Result<()> {
        let data = Ipv4Addr::new(192, 168, 10, 10).octets();
        let question = Query::new("google.com", RRType::A, RRClass::IN)?;
        let answer = Answer::new(question.name.clone(), RRType::A, RRClass::IN, 60, &data);
        let flags = Flags {
            qr: 1,
            ra: 1,
            ..Flags::query()
        };
        let bytes = DNSHdr::new(7, flags, vec![question.clone()], vec![answer]).to_bytes();

        let (_, hdr) = DNSHdr::from_bytes(&bytes).map_err(|e| e.to_owned())?;
        assert_eq!(hdr.flags.qr, 1);
        assert!(hdr.queries[0].matches(&question));
        assert_eq!(hdr.answers.len(), 1);
        assert_eq!(hdr.answers[0].ttl, 60);
        assert_eq!(hdr.answers[0].data(), &data);

        Ok(())
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // question name is a pointer to itself
        let buf = &[0, 1, 0x81, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0xc0, 12, 0, 1, 0, 1];
        assert!(DNSHdr::from_bytes(buf).is_err());
    }

    #[test]
    fn test_truncated_message_rejected() {
        let buf = &[0, 1, 0x81, 0, 0, 1, 0, 0, 0, 0, 0, 0, 3, b'a'];
        assert!(DNSHdr::from_bytes(buf).is_err());
        assert_eq!(DNSHdr::peek_id(buf), Some(1));
        assert_eq!(DNSHdr::peek_id(&[7]), None);
    }

    #[test]
    fn test_matches_ignores_case() -> Result<()> {
        let a = Query::new("Example.COM", RRType::A, RRClass::IN)?;
        let b = Query::new("example.com.", RRType::A, RRClass::IN)?;
        let c = Query::new("example.com", RRType::AAAA, RRClass::IN)?;
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
        Ok(())
    }

    #[test]
    fn test_bad_names() {
        assert!(matches!(
            Query::new("a..b", RRType::A, RRClass::IN),
            Err(NameError::EmptyLabel(_))
        ));
        let long = "x".repeat(64);
        assert!(matches!(
            Query::new(&long, RRType::A, RRClass::IN),
            Err(NameError::LongLabel(_))
        ));
        let huge = vec!["abcdefghij"; 30].join(".");
        assert!(matches!(
            Query::new(&huge, RRType::A, RRClass::IN),
            Err(NameError::LongName(_))
        ));
        assert!(Query::new(".", RRType::NS, RRClass::IN).is_ok());
    }

    #[rstest]
    #[case("a", RRType::A)]
    #[case("AAAA", RRType::AAAA)]
    #[case("cname", RRType::CNAME)]
    #[case("Mx", RRType::MX)]
    #[case("ns", RRType::NS)]
    #[case("ptr", RRType::PTR)]
    #[case("soa", RRType::SOA)]
    #[case("srv", RRType::SRV)]
    #[case("txt", RRType::TXT)]
    #[case("any", RRType::ANY)]
    fn test_record_type_from_str(#[case] input: &str, #[case] expected: RRType) {
        assert_eq!(input.parse::<RRType>(), Ok(expected));
    }

    #[test]
    fn test_unknown_record_type() {
        let err = "ZZZ".parse::<RRType>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown record type: ZZZ");
    }
}
