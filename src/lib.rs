pub mod config;
pub mod contenthash;
pub mod lookup;
pub mod oracle;
pub mod records;
pub mod server;
pub mod synth;
pub mod telemetry;

pub use crate::config::{NearLinkConfig, ResolverSettings};
pub use crate::contenthash::{ContentHash, resolve_content_hash};
pub use crate::lookup::{
    AlwaysAuthoritative, AuthorityPolicy, LookupQuery, LookupResult, NearLinkResolver, QueryError,
    SynthesizedAnswer, ZoneAuthority,
};
pub use crate::oracle::{NearRpcClient, OracleClient, OracleError, OracleMethod};
pub use crate::synth::{RecordSynthesizer, SynthesisError};
