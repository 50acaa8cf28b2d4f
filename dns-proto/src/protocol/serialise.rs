//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use std::collections::HashMap;

use crate::protocol::types::*;

/// See the header diagram in `types::Header`.
const HEADER_MASK_QR: u8 = 0b1000_0000;
const HEADER_MASK_OPCODE: u8 = 0b0111_1000;
const HEADER_OFFSET_OPCODE: u8 = 3;
const HEADER_MASK_AA: u8 = 0b0000_0100;
const HEADER_MASK_TC: u8 = 0b0000_0010;
const HEADER_MASK_RD: u8 = 0b0000_0001;
const HEADER_MASK_RA: u8 = 0b1000_0000;
const HEADER_MASK_RCODE: u8 = 0b0000_1111;
const HEADER_OFFSET_RCODE: u8 = 0;

/// Marks a two-octet field as a compression pointer rather than a
/// label length (RFC 1035 section 4.1.4).
const POINTER_FLAG: u16 = 0b1100_0000_0000_0000;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer),
            RecordTypeWithData::MD { madname } => madname.serialise(buffer),
            RecordTypeWithData::MF { madname } => madname.serialise(buffer),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer);
                rname.serialise(buffer);
                buffer.write_u32(serial);
                buffer.write_u32(refresh);
                buffer.write_u32(retry);
                buffer.write_u32(expire);
                buffer.write_u32(minimum);
            }
            RecordTypeWithData::MB { madname } => madname.serialise(buffer),
            RecordTypeWithData::MG { mdmname } => mdmname.serialise(buffer),
            RecordTypeWithData::MR { newname } => newname.serialise(buffer),
            RecordTypeWithData::NULL { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::WKS { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer),
            RecordTypeWithData::HINFO { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::MINFO { rmailbx, emailbx } => {
                rmailbx.serialise(buffer);
                emailbx.serialise(buffer);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(preference);
                exchange.serialise(buffer);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::OPT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Writes the name using compression where possible: if a suffix
    /// of this name's labels has already been written earlier in the
    /// message, a pointer to that occurrence replaces the suffix.
    /// Every name (and suffix of a name) written is recorded for later
    /// names to point at in turn.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        let mut labels = self.labels.as_slice();

        loop {
            if labels.len() == 1 {
                // just the root label left: write the terminator and
                // stop, there's nothing left to point at.
                buffer.write_u8(0);
                return;
            }

            let suffix_name = DomainName::from_labels(labels.to_vec())
                .expect("a suffix of a valid name is a valid name");

            if let Some(&pointer) = buffer.name_offsets.get(&suffix_name) {
                buffer.write_u16(POINTER_FLAG | pointer);
                return;
            }

            // RFC 1035 pointers are 14 bits: a name written past that
            // offset into the message can't be pointed at, so don't
            // bother recording it.
            if let Ok(offset) = u16::try_from(buffer.index()) {
                if offset & POINTER_FLAG == 0 {
                    buffer.name_offsets.insert(suffix_name, offset);
                }
            }

            let label = &labels[0];
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(label);
            labels = &labels[1..];
        }
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,

    /// Every domain name (and suffix thereof) written so far, and the
    /// octet offset it starts at, for compression.
    name_offsets: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
            name_offsets: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        for octet in octets {
            self.octets.push(*octet);
        }
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::deserialise::ConsumableBuffer;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                // "mx.example.com." shares a suffix with "www.example.com."
                // written above, so it's a pointer rather than inline labels.
                0b1100_0000, 4,
            ],
            buf.octets,
        );
    }

    #[test]
    fn compression_round_trips() {
        let mut buf = WritableBuffer::default();
        let rr1 = ns_record("example.com.", "ns1.example.com.");
        let rr2 = ns_record("example.com.", "ns2.example.com.");
        rr1.clone().serialise(&mut buf).unwrap();
        rr2.clone().serialise(&mut buf).unwrap();

        // compression must actually have made the second record
        // smaller than the first despite identical shape.
        assert!(buf.octets.len() < 2 * (rr1.name.octets.len() + 32));

        let mut cbuf = ConsumableBuffer::new(&buf.octets);
        let parsed1 = ResourceRecord::deserialise(0, &mut cbuf).unwrap();
        let parsed2 = ResourceRecord::deserialise(0, &mut cbuf).unwrap();
        assert_eq!(rr1, parsed1);
        assert_eq!(rr2, parsed2);
    }

    /// Every combination of the 13 flag bits in a header (qr, 4-bit
    /// opcode, aa, tc, rd, ra, 4-bit rcode) round trips through the
    /// wire format unchanged.
    #[test]
    fn header_flags_round_trip_all_combinations() {
        for bits in 0u16..(1 << 13) {
            let header = Header {
                id: 0,
                is_response: bits & 0b1 != 0,
                opcode: Opcode::from(((bits >> 1) & 0b1111) as u8),
                is_authoritative: bits & 0b10_0000 != 0,
                is_truncated: bits & 0b100_0000 != 0,
                recursion_desired: bits & 0b1000_0000 != 0,
                recursion_available: bits & 0b1_0000_0000 != 0,
                rcode: Rcode::from(((bits >> 9) & 0b1111) as u8),
            };

            let mut buf = WritableBuffer::default();
            header.clone().serialise(&mut buf);

            let mut cbuf = ConsumableBuffer::new(&buf.octets);
            let parsed = WireHeader::deserialise(&mut cbuf).unwrap();

            assert_eq!(header, parsed.header, "bits = {bits:013b}");
        }
    }
}
