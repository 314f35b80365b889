use std::sync::Arc;

use anyhow::{Context, Result};
use hickory_proto::rr::{Name, Record, RecordType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthoritySection, ResolverSettings};
use crate::contenthash::resolve_content_hash;
use crate::oracle::{OracleClient, OracleError};
use crate::synth::{RecordSynthesizer, SynthesisError, is_synthesized};

/// Decides whether this resolver answers for a domain at all.
pub trait AuthorityPolicy: Send + Sync {
    fn is_authoritative(&self, domain: &Name) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAuthoritative;

impl AuthorityPolicy for AlwaysAuthoritative {
    fn is_authoritative(&self, _domain: &Name) -> bool {
        true
    }
}

/// Authoritative for the configured zones and everything beneath them.
#[derive(Debug, Clone)]
pub struct ZoneAuthority {
    zones: Vec<Name>,
}

impl ZoneAuthority {
    pub fn new(zones: Vec<Name>) -> Self {
        Self { zones }
    }
}

impl AuthorityPolicy for ZoneAuthority {
    fn is_authoritative(&self, domain: &Name) -> bool {
        self.zones.iter().any(|zone| zone.zone_of(domain))
    }
}

/// Policy for an `[authority]` section: every name when no zones are listed.
pub fn authority_from_config(section: &AuthoritySection) -> Result<Box<dyn AuthorityPolicy>> {
    if section.zones.is_empty() {
        return Ok(Box::new(AlwaysAuthoritative));
    }
    let zones = section
        .zones
        .iter()
        .map(|zone| {
            Name::from_ascii(zone).with_context(|| format!("invalid authority zone: {zone}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Box::new(ZoneAuthority::new(zones)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    pub domain: Name,
    pub name: Name,
    pub qtype: RecordType,
    pub dnssec_ok: bool,
}

impl LookupQuery {
    /// Query where the ledger domain and the requested name coincide.
    pub fn for_name(name: Name, qtype: RecordType, dnssec_ok: bool) -> Self {
        Self {
            domain: name.clone(),
            name,
            qtype,
            dnssec_ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Success,
    NoData,
    NameError,
    ServerFailure,
}

impl LookupResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupResult::Success => "success",
            LookupResult::NoData => "nodata",
            LookupResult::NameError => "nxdomain",
            LookupResult::ServerFailure => "servfail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAnswer {
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
    pub result: LookupResult,
}

impl SynthesizedAnswer {
    pub fn empty(result: LookupResult) -> Self {
        Self {
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            result,
        }
    }

    fn success(answers: Vec<Record>) -> Self {
        Self {
            answers,
            ..Self::empty(LookupResult::Success)
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("content hash lookup failed: {0}")]
    ContentHash(#[source] OracleError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Answers queries for ledger-anchored domains.
pub struct NearLinkResolver<O: OracleClient> {
    settings: Arc<ResolverSettings>,
    oracle: O,
    authority: Box<dyn AuthorityPolicy>,
}

impl<O: OracleClient> NearLinkResolver<O> {
    pub fn new(settings: Arc<ResolverSettings>, oracle: O) -> Self {
        Self {
            settings,
            oracle,
            authority: Box::new(AlwaysAuthoritative),
        }
    }

    pub fn with_authority(mut self, authority: Box<dyn AuthorityPolicy>) -> Self {
        self.authority = authority;
        self
    }

    /// Records for a query, or an empty set when the domain has no content hash.
    pub fn query(&self, query: &LookupQuery) -> Result<Vec<Record>, QueryError> {
        let hash = resolve_content_hash(&self.oracle, &self.settings, &query.domain.to_ascii())
            .map_err(QueryError::ContentHash)?;
        if !hash.is_present() {
            debug!(domain = %query.domain, "Domain has no content hash");
            return Ok(Vec::new());
        }
        let records = RecordSynthesizer::new(&self.oracle, &self.settings).synthesize(
            query.qtype,
            &query.domain,
            &query.name,
            &hash,
        )?;
        Ok(records)
    }

    pub fn lookup(&self, query: &LookupQuery) -> SynthesizedAnswer {
        debug!(
            domain = %query.domain,
            name = %query.name,
            qtype = %query.qtype,
            dnssec_ok = query.dnssec_ok,
            "Lookup started"
        );

        if !self.authority.is_authoritative(&query.domain) {
            debug!(domain = %query.domain, "Not authoritative for domain");
            return SynthesizedAnswer::empty(LookupResult::NameError);
        }
        if !is_synthesized(query.qtype) {
            return SynthesizedAnswer::empty(LookupResult::NoData);
        }

        match self.query(query) {
            Ok(records) if records.is_empty() => SynthesizedAnswer::empty(LookupResult::NoData),
            Ok(records) => SynthesizedAnswer::success(records),
            Err(QueryError::ContentHash(err)) => {
                warn!(domain = %query.domain, error = %err, "Content hash unavailable");
                SynthesizedAnswer::empty(LookupResult::NoData)
            }
            Err(err @ QueryError::Synthesis(_)) => {
                warn!(
                    domain = %query.domain,
                    qtype = %query.qtype,
                    error = %err,
                    "Record synthesis failed"
                );
                SynthesizedAnswer::empty(LookupResult::ServerFailure)
            }
        }
    }
}
