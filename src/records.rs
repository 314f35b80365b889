use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Datelike, Timelike, Utc};
use hickory_proto::rr::rdata::{A, AAAA, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use thiserror::Error;

pub const SOA_TTL: u32 = 10800;
pub const SOA_REFRESH: i32 = 3600;
pub const SOA_RETRY: i32 = 600;
pub const SOA_EXPIRE: i32 = 1_209_600;
pub const SOA_MINIMUM: u32 = 300;
pub const RECORD_TTL: u32 = 3600;
/// Longest character-string a TXT record can hold.
pub const TXT_CHUNK_LEN: usize = 255;

/// A raw record set stopped decoding at `offset`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("record set undecodable at offset {offset}: {reason}")]
pub struct RecordDecodeError {
    pub offset: usize,
    pub reason: String,
}

/// Walks a packed buffer of wire-format resource records.
///
/// Yields records in order until the buffer is exhausted or a record fails to
/// decode; after a failure the iterator is fused and the error is kept in
/// [`RecordSetDecoder::error`].
#[derive(Debug)]
pub struct RecordSetDecoder<'a> {
    bytes: &'a [u8],
    offset: usize,
    error: Option<RecordDecodeError>,
}

impl<'a> RecordSetDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            error: None,
        }
    }

    pub fn error(&self) -> Option<&RecordDecodeError> {
        self.error.as_ref()
    }

    fn finished(&self) -> bool {
        self.error.is_some() || self.offset >= self.bytes.len()
    }
}

impl Iterator for RecordSetDecoder<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.finished() {
            return None;
        }
        let mut decoder = BinDecoder::new(&self.bytes[self.offset..]);
        match Record::<RData>::read(&mut decoder) {
            Ok(record) if decoder.index() > 0 => {
                self.offset += decoder.index();
                Some(record)
            }
            Ok(_) => {
                self.error = Some(RecordDecodeError {
                    offset: self.offset,
                    reason: "decoder made no progress".into(),
                });
                None
            }
            Err(err) => {
                self.error = Some(RecordDecodeError {
                    offset: self.offset,
                    reason: err.to_string(),
                });
                None
            }
        }
    }
}

/// Decode every record of a raw set, returning what decoded before any failure.
pub fn decode_record_set(bytes: &[u8]) -> (Vec<Record>, Option<RecordDecodeError>) {
    let mut decoder = RecordSetDecoder::new(bytes);
    let records = decoder.by_ref().collect();
    (records, decoder.error)
}

/// `YYYYMMDDSS`, where `SS` is the time of day as hundredths of a day.
pub fn soa_serial(now: DateTime<Utc>) -> u32 {
    let fraction = ((now.hour() * 3600 + now.minute()) * 100) / 86400;
    now.year() as u32 * 1_000_000 + now.month() * 10_000 + now.day() * 100 + fraction
}

pub fn soa_record(
    owner: &Name,
    primary: &Name,
    now: DateTime<Utc>,
) -> Result<Record, hickory_proto::ProtoError> {
    let hostmaster = Name::from_ascii("hostmaster")?.append_domain(owner)?;
    let soa = SOA::new(
        primary.clone(),
        hostmaster,
        soa_serial(now),
        SOA_REFRESH,
        SOA_RETRY,
        SOA_EXPIRE,
        SOA_MINIMUM,
    );
    Ok(Record::from_rdata(owner.clone(), SOA_TTL, RData::SOA(soa)))
}

pub fn ns_record(owner: &Name, nameserver: &Name) -> Record {
    Record::from_rdata(owner.clone(), RECORD_TTL, RData::NS(NS(nameserver.clone())))
}

/// TXT record carrying `text`, split into character-strings of at most 255 bytes.
pub fn txt_record(owner: &Name, text: String) -> Record {
    Record::from_rdata(owner.clone(), RECORD_TTL, RData::TXT(TXT::new(txt_chunks(text))))
}

fn txt_chunks(text: String) -> Vec<String> {
    if text.len() <= TXT_CHUNK_LEN {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut current = String::with_capacity(TXT_CHUNK_LEN);
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > TXT_CHUNK_LEN {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    chunks.push(current);
    chunks
}

pub fn a_record(owner: &Name, addr: Ipv4Addr) -> Record {
    Record::from_rdata(owner.clone(), RECORD_TTL, RData::A(A(addr)))
}

pub fn aaaa_record(owner: &Name, addr: Ipv6Addr) -> Record {
    Record::from_rdata(owner.clone(), RECORD_TTL, RData::AAAA(AAAA(addr)))
}

#[cfg(test)]
pub(crate) fn pack(records: &[Record]) -> Vec<u8> {
    use hickory_proto::serialize::binary::BinEncodable;

    records
        .iter()
        .flat_map(|record| record.to_bytes().expect("record encodes"))
        .collect()
}
