//! Best-effort decoding of raw DNS messages (RFC 1035 §4).
//!
//! The proxy only needs three projections of a message: the question name,
//! the A/AAAA answer addresses, and a synthesized SERVFAIL reply. Everything
//! here is a pure function over the byte buffer. Malformed input degrades to
//! a partial or empty result; nothing in this module returns an error or
//! panics, because these projections feed best-effort logging while the raw
//! bytes are relayed verbatim either way.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Size of the fixed DNS message header.
pub const HEADER_LEN: usize = 12;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

/// Decodes a domain name starting at `offset`, following compression
/// pointers (RFC 1035 §4.1.4).
///
/// Each distinct pointer value is followed at most once; a pointer that was
/// already visited ends decoding with whatever labels were collected, so a
/// self-referential or cyclic chain terminates instead of looping.
///
/// Returns the lower-cased, dot-joined name and the offset just past the
/// *uncompressed* occurrence of the name — the position a caller continues
/// scanning from. When the name opens directly with a pointer the returned
/// offset is the position after the pointer pair.
pub fn decode_name(buf: &[u8], offset: usize) -> (String, usize) {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = offset;
    let mut end_offset = offset;
    let mut jumped = false;
    let mut seen_pointers: BTreeSet<usize> = BTreeSet::new();

    loop {
        if cursor >= buf.len() {
            break;
        }

        let length = buf[cursor] as usize;
        if length == 0 {
            cursor += 1;
            if !jumped {
                end_offset = cursor;
            }
            break;
        }

        // Two high bits set: 14-bit back-pointer into the message.
        if length & 0xC0 == 0xC0 {
            if cursor + 1 >= buf.len() {
                break;
            }
            let pointer = ((length & 0x3F) << 8) | buf[cursor + 1] as usize;
            if !seen_pointers.insert(pointer) {
                break;
            }
            if !jumped {
                end_offset = cursor + 2;
            }
            cursor = pointer;
            jumped = true;
            continue;
        }

        // 0x40/0x80 are reserved label types.
        if length & 0xC0 != 0 {
            break;
        }

        cursor += 1;
        if cursor + length > buf.len() {
            break;
        }
        let label = String::from_utf8_lossy(&buf[cursor..cursor + length]).to_lowercase();
        labels.push(label);
        cursor += length;
        if !jumped {
            end_offset = cursor;
        }
    }

    let name = labels
        .iter()
        .filter(|l| !l.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(".")
        .trim_matches('.')
        .to_string();

    if end_offset <= offset {
        end_offset = cursor;
    }
    (name, end_offset)
}

/// Extracts the first question name from a query, or `None` when the header
/// is truncated, QDCOUNT is zero, or no name is decodable.
pub fn extract_query_domain(msg: &[u8]) -> Option<String> {
    if msg.len() < HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    if qdcount == 0 {
        return None;
    }
    let (domain, _) = decode_name(msg, HEADER_LEN);
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Collects the textual addresses of all A and AAAA class-IN answer records.
///
/// Unrelated record types and classes are skipped over by their declared
/// RDLENGTH, never misread as addresses. A record that would read past the
/// buffer ends iteration with whatever was collected so far. The result is
/// deduplicated and sorted.
pub fn extract_answer_ips(msg: &[u8]) -> Vec<String> {
    if msg.len() < HEADER_LEN {
        return Vec::new();
    }

    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);
    let mut offset = HEADER_LEN;

    for _ in 0..qdcount {
        let (_, next) = decode_name(msg, offset);
        offset = next;
        if offset + 4 > msg.len() {
            return Vec::new();
        }
        offset += 4; // QTYPE + QCLASS
    }

    let mut ips: BTreeSet<String> = BTreeSet::new();
    for _ in 0..ancount {
        let (_, next) = decode_name(msg, offset);
        offset = next;
        if offset + 10 > msg.len() {
            break;
        }

        let rtype = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
        let rclass = u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]);
        let rdlen = u16::from_be_bytes([msg[offset + 8], msg[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlen > msg.len() {
            break;
        }

        let rdata = &msg[offset..offset + rdlen];
        offset += rdlen;

        if rclass != CLASS_IN {
            continue;
        }
        if rtype == TYPE_A && rdlen == 4 {
            let octets: [u8; 4] = rdata.try_into().unwrap_or([0; 4]);
            ips.insert(Ipv4Addr::from(octets).to_string());
        } else if rtype == TYPE_AAAA && rdlen == 16 {
            let octets: [u8; 16] = rdata.try_into().unwrap_or([0; 16]);
            ips.insert(Ipv6Addr::from(octets).to_string());
        }
    }

    ips.into_iter().collect()
}

/// Builds a SERVFAIL reply for `query`: same transaction ID, question
/// section echoed, QR and RA set, RCODE 2, all other section counts zeroed.
///
/// Returns `None` when the query is shorter than a DNS header.
pub fn make_servfail(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let mut reply = Vec::with_capacity(query.len());
    reply.extend_from_slice(&query[0..2]);
    reply.extend_from_slice(&[0x81, 0x82]); // QR | RD set, RA, RCODE = SERVFAIL
    reply.extend_from_slice(&query[4..6]); // QDCOUNT preserved
    reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR zeroed
    reply.extend_from_slice(&query[HEADER_LEN..]);
    Some(reply)
}
