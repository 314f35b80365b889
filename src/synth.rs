use std::net::IpAddr;

use chrono::Utc;
use hickory_proto::rr::{Name, Record, RecordType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{IpFamily, ResolverSettings};
use crate::contenthash::ContentHash;
use crate::oracle::{OracleClient, OracleMethod, fetch_bytes};
use crate::records::{
    a_record, aaaa_record, decode_record_set, ns_record, soa_record, txt_record,
};

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("failed to build {rtype} record for {name}: {reason}")]
    Build {
        rtype: RecordType,
        name: String,
        reason: String,
    },
    #[error("gateway address {address:?} is not a valid {rtype} address")]
    InvalidGateway { rtype: RecordType, address: String },
}

/// Query types answered from the ledger; anything else yields no data.
pub fn is_synthesized(qtype: RecordType) -> bool {
    matches!(
        qtype,
        RecordType::SOA | RecordType::NS | RecordType::TXT | RecordType::A | RecordType::AAAA
    )
}

/// Builds answer records for a domain whose content hash is set.
pub struct RecordSynthesizer<'a, O: OracleClient + ?Sized> {
    oracle: &'a O,
    settings: &'a ResolverSettings,
}

impl<'a, O: OracleClient + ?Sized> RecordSynthesizer<'a, O> {
    pub fn new(oracle: &'a O, settings: &'a ResolverSettings) -> Self {
        Self { oracle, settings }
    }

    pub fn synthesize(
        &self,
        qtype: RecordType,
        domain: &Name,
        name: &Name,
        hash: &ContentHash,
    ) -> Result<Vec<Record>, SynthesisError> {
        match qtype {
            RecordType::SOA => self.soa(name),
            RecordType::NS => Ok(self.ns(domain)),
            RecordType::TXT => Ok(self.txt(domain, name, hash)),
            RecordType::A => self.address(IpFamily::V4, domain, name),
            RecordType::AAAA => self.address(IpFamily::V6, domain, name),
            _ => Ok(Vec::new()),
        }
    }

    fn soa(&self, name: &Name) -> Result<Vec<Record>, SynthesisError> {
        let Some(primary) = self.settings.nameservers.first() else {
            return Ok(Vec::new());
        };
        let record = soa_record(name, primary, Utc::now()).map_err(|err| SynthesisError::Build {
            rtype: RecordType::SOA,
            name: name.to_ascii(),
            reason: err.to_string(),
        })?;
        Ok(vec![record])
    }

    fn ns(&self, domain: &Name) -> Vec<Record> {
        self.settings
            .nameservers
            .iter()
            .map(|nameserver| ns_record(domain, nameserver))
            .collect()
    }

    fn txt(&self, domain: &Name, name: &Name, hash: &ContentHash) -> Vec<Record> {
        let mut records = self.fetch_set(OracleMethod::GetTxt, domain);
        records.push(txt_record(name, hash.txt_value()));
        if self.settings.dnslink {
            if let Some(value) = hash.dnslink_value() {
                records.push(txt_record(name, value));
            }
        }
        records
    }

    fn address(
        &self,
        family: IpFamily,
        domain: &Name,
        name: &Name,
    ) -> Result<Vec<Record>, SynthesisError> {
        let method = match family {
            IpFamily::V4 => OracleMethod::GetA,
            IpFamily::V6 => OracleMethod::GetAaaa,
        };
        let records = self.fetch_set(method, domain);
        if !records.is_empty() {
            return Ok(records);
        }
        self.gateway_records(family, name)
    }

    fn gateway_records(
        &self,
        family: IpFamily,
        name: &Name,
    ) -> Result<Vec<Record>, SynthesisError> {
        let mut records = Vec::new();
        for entry in self.settings.gateways_for(family) {
            match entry.trim().parse::<IpAddr>() {
                Ok(addr) if family.matches(&addr) => records.push(match addr {
                    IpAddr::V4(v4) => a_record(name, v4),
                    IpAddr::V6(v6) => aaaa_record(name, v6),
                }),
                _ if family == IpFamily::V4 => {
                    return Err(SynthesisError::InvalidGateway {
                        rtype: RecordType::A,
                        address: entry.clone(),
                    });
                }
                _ => {
                    warn!(address = %entry, "Skipping malformed AAAA gateway entry");
                }
            }
        }
        debug!(name = %name, count = records.len(), "Answering with gateway addresses");
        Ok(records)
    }

    /// Oracle record set for `method`; failures count as an empty set.
    fn fetch_set(&self, method: OracleMethod, domain: &Name) -> Vec<Record> {
        let account_id = self.settings.account_id(&domain.to_ascii());
        let bytes = match fetch_bytes(
            self.oracle,
            &self.settings.contract_account,
            method,
            &account_id,
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    method = %method,
                    account_id = %account_id,
                    error = %err,
                    "Oracle record lookup failed"
                );
                return Vec::new();
            }
        };

        let (records, error) = decode_record_set(&bytes);
        if let Some(error) = error {
            warn!(
                method = %method,
                account_id = %account_id,
                offset = error.offset,
                kept = records.len(),
                reason = %error.reason,
                "Oracle record set truncated at undecodable entry"
            );
        }
        records
    }
}
