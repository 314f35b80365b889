pub mod daemon;
pub mod metrics;
pub mod upstream;

use std::fmt;
use std::sync::Arc;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use tokio::task;
use tracing::{debug, error, warn};

use crate::lookup::{LookupQuery, LookupResult, NearLinkResolver, SynthesizedAnswer};
use crate::oracle::OracleClient;

pub use daemon::NearLinkDaemon;
pub use metrics::DnsMetrics;
pub use upstream::{DNS_CONTENT_TYPE, UpstreamForwarder};

/// Payload size advertised in EDNS replies.
pub const MAX_UDP_PAYLOAD: u16 = 4096;
/// Payload limit for UDP clients that send no EDNS record.
pub const DEFAULT_UDP_PAYLOAD: u16 = 512;

pub type SharedResolver = Arc<NearLinkResolver<Arc<dyn OracleClient>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Https,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Https => "https",
        })
    }
}

#[derive(Debug)]
pub enum DnsProcessError {
    /// Not a DNS message; the request is dropped (or rejected over HTTP).
    BadRequest(String),
    Internal(String),
}

/// DNS message in, DNS message out, for every listener.
pub struct DnsHandler {
    resolver: SharedResolver,
    upstream: Option<UpstreamForwarder>,
    metrics: Arc<DnsMetrics>,
}

impl DnsHandler {
    pub fn new(
        resolver: SharedResolver,
        upstream: Option<UpstreamForwarder>,
        metrics: Arc<DnsMetrics>,
    ) -> Self {
        Self {
            resolver,
            upstream,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<DnsMetrics> {
        &self.metrics
    }

    /// Answer one wire-format query.
    pub async fn handle(
        &self,
        payload: &[u8],
        transport: Transport,
    ) -> Result<Vec<u8>, DnsProcessError> {
        self.metrics.inc_query();
        let request = Message::from_vec(payload).map_err(|err| {
            self.metrics.inc_malformed();
            debug!(transport = %transport, error = %err, "Failed to parse DNS message");
            DnsProcessError::BadRequest(format!("failed to parse DNS message: {err}"))
        })?;

        let reply = self.respond(&request, transport).await?;
        if transport == Transport::Udp {
            return fit_udp_payload(&request, reply);
        }
        Ok(reply)
    }

    async fn respond(
        &self,
        request: &Message,
        transport: Transport,
    ) -> Result<Vec<u8>, DnsProcessError> {
        if request.message_type() != MessageType::Query || request.queries().is_empty() {
            self.metrics.inc_malformed();
            return encode(&response_for(request, ResponseCode::FormErr));
        }
        if request.op_code() != OpCode::Query {
            debug!(transport = %transport, op_code = ?request.op_code(), "Unsupported opcode");
            return encode(&response_for(request, ResponseCode::NotImp));
        }

        let question = &request.queries()[0];
        let name = question.name().to_lowercase();
        let dnssec_ok = request
            .extensions()
            .as_ref()
            .is_some_and(|edns| edns.flags().dnssec_ok);
        let query = LookupQuery::for_name(name, question.query_type(), dnssec_ok);

        let resolver = Arc::clone(&self.resolver);
        let lookup = query.clone();
        let answer = task::spawn_blocking(move || resolver.lookup(&lookup))
            .await
            .map_err(|err| {
                error!(error = %err, "Lookup task failed");
                DnsProcessError::Internal(format!("lookup task failed: {err}"))
            })?;

        debug!(
            transport = %transport,
            name = %query.name,
            qtype = %query.qtype,
            result = answer.result.as_str(),
            answers = answer.answers.len(),
            "Lookup finished"
        );
        self.metrics.record_result(answer.result);

        match answer.result {
            LookupResult::Success => encode(&answer_message(request, answer)),
            LookupResult::NoData => self.delegate(request).await,
            LookupResult::NameError => {
                let mut response = response_for(request, ResponseCode::NXDomain);
                response.set_authoritative(true);
                encode(&response)
            }
            LookupResult::ServerFailure => encode(&response_for(request, ResponseCode::ServFail)),
        }
    }

    async fn delegate(&self, request: &Message) -> Result<Vec<u8>, DnsProcessError> {
        let Some(upstream) = &self.upstream else {
            let mut response = response_for(request, ResponseCode::NoError);
            response.set_authoritative(true);
            return encode(&response);
        };
        match upstream.forward(request).await {
            Ok(bytes) => {
                self.metrics.inc_forwarded();
                Ok(bytes)
            }
            Err(err) => {
                self.metrics.inc_upstream_failure();
                warn!(endpoint = upstream.endpoint(), error = %err, "Upstream forward failed");
                encode(&response_for(request, ResponseCode::ServFail))
            }
        }
    }
}

/// Reply skeleton: header copied from the request, question echoed, EDNS echoed.
fn response_for(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(false);
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());

    if let Some(edns) = request.extensions() {
        let mut reply_edns = Edns::new();
        reply_edns.set_max_payload(MAX_UDP_PAYLOAD);
        reply_edns.set_dnssec_ok(edns.flags().dnssec_ok);
        *response.extensions_mut() = Some(reply_edns);
    }
    response
}

fn answer_message(request: &Message, answer: SynthesizedAnswer) -> Message {
    let mut response = response_for(request, ResponseCode::NoError);
    response.set_authoritative(true);
    response.add_answers(answer.answers);
    response.add_name_servers(answer.authority);
    response.add_additionals(answer.additional);
    response
}

fn encode(message: &Message) -> Result<Vec<u8>, DnsProcessError> {
    message.to_vec().map_err(|err| {
        error!(error = %err, "Failed to serialise DNS response");
        DnsProcessError::Internal(format!("failed to serialise DNS response: {err}"))
    })
}

/// Replace replies larger than the client can take with a truncated header.
fn fit_udp_payload(request: &Message, reply: Vec<u8>) -> Result<Vec<u8>, DnsProcessError> {
    let limit = request
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload().max(DEFAULT_UDP_PAYLOAD))
        .unwrap_or(DEFAULT_UDP_PAYLOAD);
    if reply.len() <= limit as usize {
        return Ok(reply);
    }

    let code = Message::from_vec(&reply)
        .map(|message| message.response_code())
        .unwrap_or(ResponseCode::ServFail);
    debug!(size = reply.len(), limit, "Truncating UDP reply");
    let mut truncated = response_for(request, code);
    truncated.set_authoritative(code != ResponseCode::ServFail);
    truncated.set_truncated(true);
    encode(&truncated)
}

/// SERVFAIL for a raw query, or `None` when the query cannot be parsed.
pub fn build_error_response(query: &[u8], code: ResponseCode) -> Option<Vec<u8>> {
    let request = Message::from_vec(query).ok()?;
    response_for(&request, code).to_vec().ok()
}


#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData, RecordType};

    use super::testing::*;
    use super::*;
    use crate::oracle::OracleMethod;
    use crate::oracle::stub::StubOracle;

    fn dnssec_edns(payload: u16) -> Edns {
        let mut edns = Edns::new();
        edns.set_max_payload(payload);
        edns.set_dnssec_ok(true);
        edns
    }

    async fn reply(handler: &DnsHandler, bytes: &[u8], transport: Transport) -> Message {
        let raw = handler.handle(bytes, transport).await.unwrap();
        Message::from_vec(&raw).unwrap()
    }

    #[tokio::test]
    async fn success_is_authoritative_noerror() {
        let handler = handler();
        let query = query_bytes("Alice.Link.", RecordType::TXT, None);
        let response = reply(&handler, &query, Transport::Tcp).await;
        assert_eq!(response.id(), 4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        assert_eq!(response.answers().len(), 1);
        assert!(matches!(response.answers()[0].data(), RData::TXT(_)));
        assert_eq!(response.answers()[0].name().to_ascii(), "alice.link.");
        assert!(response.extensions().is_none());
    }

    #[tokio::test]
    async fn edns_do_bit_is_echoed() {
        let handler = handler();
        let query = query_bytes("alice.link.", RecordType::NS, Some(dnssec_edns(1232)));
        let response = reply(&handler, &query, Transport::Udp).await;
        let edns = response.extensions().as_ref().expect("edns echoed");
        assert!(edns.flags().dnssec_ok);
        assert_eq!(edns.max_payload(), MAX_UDP_PAYLOAD);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn outside_zone_is_nxdomain() {
        let handler = handler();
        let query = query_bytes("alice.example.", RecordType::A, None);
        let response = reply(&handler, &query, Transport::Udp).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn nodata_without_upstream_is_empty_noerror() {
        let handler = handler();
        let query = query_bytes("alice.link.", RecordType::MX, None);
        let response = reply(&handler, &query, Transport::Udp).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn synthesis_failure_is_servfail() {
        let mut settings = settings();
        settings.gateway_a = vec!["bogus".into()];
        let handler = handler_with(settings, stub_with_hash(), None);
        let query = query_bytes("alice.link.", RecordType::A, None);
        let response = reply(&handler, &query, Transport::Udp).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_servfail() {
        let upstream =
            UpstreamForwarder::new("http://127.0.0.1:9/dns-query", Duration::from_secs(1)).unwrap();
        let handler = handler_with(settings(), stub_with_hash(), Some(upstream));
        let query = query_bytes("alice.link.", RecordType::MX, None);
        let response = reply(&handler, &query, Transport::Tcp).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);

        let text = String::from_utf8(handler.metrics().render().unwrap()).unwrap();
        assert!(text.contains("nearlink_upstream_failures_total 1"));
        assert!(text.contains("nearlink_nodata_total 1"));
    }

    #[tokio::test]
    async fn missing_question_is_formerr() {
        let mut message = Message::new();
        message.set_id(9);
        let bytes = message.to_vec().unwrap();
        let response = reply(&handler(), &bytes, Transport::Udp).await;
        assert_eq!(response.response_code(), ResponseCode::FormErr);
        assert_eq!(response.id(), 9);
    }

    #[tokio::test]
    async fn garbage_is_bad_request() {
        let handler = handler();
        let result = handler.handle(&[0x01, 0x02], Transport::Udp).await;
        assert!(matches!(result, Err(DnsProcessError::BadRequest(_))));
    }

    #[tokio::test]
    async fn oversized_udp_reply_is_truncated() {
        let mut settings = settings();
        settings.gateway_a = (1..=40).map(|octet| format!("10.0.0.{octet}")).collect();
        let handler = handler_with(settings, stub_with_hash(), None);
        let query = query_bytes("alice.link.", RecordType::A, None);

        let udp = reply(&handler, &query, Transport::Udp).await;
        assert!(udp.truncated());
        assert!(udp.answers().is_empty());
        assert_eq!(udp.response_code(), ResponseCode::NoError);

        let tcp = reply(&handler, &query, Transport::Tcp).await;
        assert!(!tcp.truncated());
        assert_eq!(tcp.answers().len(), 40);

        let large = query_bytes("alice.link.", RecordType::A, Some(dnssec_edns(4096)));
        let edns_udp = reply(&handler, &large, Transport::Udp).await;
        assert!(!edns_udp.truncated());
        assert_eq!(edns_udp.answers().len(), 40);
    }

    #[tokio::test]
    async fn long_content_hash_is_answered_in_chunks() {
        let oracle = StubOracle::new()
            .with_bytes(OracleMethod::GetContentHash, ACCOUNT, &[0xab; 130])
            .with_bytes(OracleMethod::GetTxt, ACCOUNT, &[]);
        let handler = handler_with(settings(), oracle, None);
        let query = query_bytes("alice.link.", RecordType::TXT, None);
        let response = reply(&handler, &query, Transport::Tcp).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::TXT(txt) => {
                let joined = txt.txt_data().concat();
                assert_eq!(txt.txt_data().len(), 2);
                assert_eq!(joined, format!("contenthash=0x{}", "ab".repeat(130)).into_bytes());
            }
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_query_opcode_is_notimp() {
        let mut message = Message::new();
        message.set_id(77);
        message.set_op_code(OpCode::Notify);
        message.add_query(Query::query(
            Name::from_str("alice.link.").unwrap(),
            RecordType::SOA,
        ));
        let handler = handler();
        let response = reply(&handler, &message.to_vec().unwrap(), Transport::Udp).await;
        assert_eq!(response.response_code(), ResponseCode::NotImp);
        assert_eq!(response.op_code(), OpCode::Notify);
        assert!(response.answers().is_empty());
        let text = String::from_utf8(handler.metrics().render().unwrap()).unwrap();
        assert!(text.contains("nearlink_success_total 0"));
    }

    #[test]
    fn error_response_echoes_question() {
        let query = query_bytes("alice.link.", RecordType::A, None);
        let bytes = build_error_response(&query, ResponseCode::ServFail).unwrap();
        let response = Message::from_vec(&bytes).unwrap();
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries().len(), 1);
        assert!(build_error_response(&[0xff], ResponseCode::ServFail).is_none());
    }
}
