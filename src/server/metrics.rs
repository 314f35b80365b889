use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

use crate::lookup::LookupResult;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct DnsMetrics {
    registry: Registry,
    queries_total: IntCounter,
    success_total: IntCounter,
    nodata_total: IntCounter,
    nxdomain_total: IntCounter,
    servfail_total: IntCounter,
    forwarded_total: IntCounter,
    upstream_failures_total: IntCounter,
    malformed_total: IntCounter,
}

impl DnsMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let queries_total = counter(
            "nearlink_queries_total",
            "Total number of DNS queries received",
        )?;
        let success_total = counter(
            "nearlink_success_total",
            "Queries answered with synthesized records",
        )?;
        let nodata_total = counter(
            "nearlink_nodata_total",
            "Queries with no records for the requested type",
        )?;
        let nxdomain_total = counter(
            "nearlink_nxdomain_total",
            "Queries for names outside the authoritative zones",
        )?;
        let servfail_total = counter(
            "nearlink_servfail_total",
            "Queries that failed with SERVFAIL",
        )?;
        let forwarded_total = counter(
            "nearlink_forwarded_total",
            "Queries answered by the upstream resolver",
        )?;
        let upstream_failures_total = counter(
            "nearlink_upstream_failures_total",
            "Upstream forwards that failed",
        )?;
        let malformed_total = counter(
            "nearlink_malformed_total",
            "Requests that could not be parsed as DNS queries",
        )?;

        Ok(Self {
            registry,
            queries_total,
            success_total,
            nodata_total,
            nxdomain_total,
            servfail_total,
            forwarded_total,
            upstream_failures_total,
            malformed_total,
        })
    }

    pub fn inc_query(&self) {
        self.queries_total.inc();
    }

    pub fn record_result(&self, result: LookupResult) {
        match result {
            LookupResult::Success => self.success_total.inc(),
            LookupResult::NoData => self.nodata_total.inc(),
            LookupResult::NameError => self.nxdomain_total.inc(),
            LookupResult::ServerFailure => self.servfail_total.inc(),
        }
    }

    pub fn inc_forwarded(&self) {
        self.forwarded_total.inc();
    }

    pub fn inc_upstream_failure(&self) {
        self.upstream_failures_total.inc();
    }

    pub fn inc_malformed(&self) {
        self.malformed_total.inc();
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
