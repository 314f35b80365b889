use std::fmt;

use cid::Cid;
use tracing::debug;
use unsigned_varint::decode as varint_decode;

use crate::config::ResolverSettings;
use crate::oracle::{OracleClient, OracleError, OracleMethod, fetch_bytes};

/// Length of the stored content hash slot.
pub const CONTENT_HASH_LEN: usize = 23;

/// Value the contract reports for a domain without a content hash.
pub const EMPTY_CONTENT_HASH: [u8; CONTENT_HASH_LEN] = [0u8; CONTENT_HASH_LEN];

const IPFS_CODEC: u64 = 0xe3;
const IPNS_CODEC: u64 = 0xe5;

/// Content reference published for a domain.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ContentHash(Vec<u8>);

impl ContentHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Strictly greater than the zero sentinel, compared byte-wise.
    ///
    /// Zero-filled or truncated-to-zero values never count as set.
    pub fn is_present(&self) -> bool {
        self.0.as_slice() > EMPTY_CONTENT_HASH.as_slice()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// TXT payload advertising the hash: `contenthash=0x<hex>`.
    pub fn txt_value(&self) -> String {
        format!("contenthash=0x{}", self.to_hex())
    }

    /// `/ipfs/<cid>` or `/ipns/<cid>` when the hash is a multicodec CID.
    pub fn dnslink_path(&self) -> Option<String> {
        let (codec, payload) = varint_decode::u64(&self.0).ok()?;
        let namespace = match codec {
            IPFS_CODEC => "ipfs",
            IPNS_CODEC => "ipns",
            _ => return None,
        };
        if payload.is_empty() {
            return None;
        }
        let cid = Cid::try_from(payload).ok()?;
        Some(format!("/{namespace}/{cid}"))
    }

    pub fn dnslink_value(&self) -> Option<String> {
        self.dnslink_path().map(|path| format!("dnslink={path}"))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash(0x{})", self.to_hex())
    }
}

/// Fetch the content hash stored for `domain`.
///
/// Callers treat both an error and an unset hash as "no reference".
pub fn resolve_content_hash<O: OracleClient + ?Sized>(
    oracle: &O,
    settings: &ResolverSettings,
    domain: &str,
) -> Result<ContentHash, OracleError> {
    let account_id = settings.account_id(domain);
    let bytes = fetch_bytes(
        oracle,
        &settings.contract_account,
        OracleMethod::GetContentHash,
        &account_id,
    )?;
    let hash = ContentHash::new(bytes);
    debug!(domain, account_id = %account_id, present = hash.is_present(), "Resolved content hash");
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unsigned_varint::encode as varint_encode;

    const SAMPLE_CID: &str = "bafybeigdyrzt3nz6mx6mxwe3ieucs5cjoxgr7d5p3qsyt4nkuppk3f2nke";

    fn multicodec(codec: u64, cid: &Cid) -> Vec<u8> {
        let mut buffer = varint_encode::u64_buffer();
        let mut bytes = varint_encode::u64(codec, &mut buffer).to_vec();
        bytes.extend_from_slice(&cid.to_bytes());
        bytes
    }

    #[test]
    fn zero_sentinel_is_absent() {
        assert!(!ContentHash::new(EMPTY_CONTENT_HASH.to_vec()).is_present());
        assert!(!ContentHash::default().is_present());
    }

    #[test]
    fn presence_is_strict_lexicographic_comparison() {
        let mut last = EMPTY_CONTENT_HASH;
        last[CONTENT_HASH_LEN - 1] = 1;
        assert!(ContentHash::new(last.to_vec()).is_present());

        let mut first = EMPTY_CONTENT_HASH;
        first[0] = 0xff;
        assert!(ContentHash::new(first.to_vec()).is_present());

        assert!(ContentHash::new(vec![0x01]).is_present());
        assert!(!ContentHash::new(vec![0x00; 5]).is_present());
    }

    #[test]
    fn presence_holds_for_every_single_nonzero_byte() {
        for position in 0..CONTENT_HASH_LEN {
            for value in [1u8, 0x7f, 0xff] {
                let mut bytes = EMPTY_CONTENT_HASH;
                bytes[position] = value;
                assert!(ContentHash::new(bytes.to_vec()).is_present());
            }
        }
    }

    #[test]
    fn txt_value_is_hex_encoded() {
        assert_eq!(ContentHash::new(vec![0x01]).txt_value(), "contenthash=0x01");
        assert_eq!(
            ContentHash::new(vec![0xe3, 0x01, 0xab]).txt_value(),
            "contenthash=0xe301ab"
        );
    }

    #[test]
    fn dnslink_decodes_ipfs_and_ipns_codecs() {
        let cid = Cid::try_from(SAMPLE_CID).expect("cid parse");
        let ipfs = ContentHash::new(multicodec(IPFS_CODEC, &cid));
        assert_eq!(ipfs.dnslink_value(), Some(format!("dnslink=/ipfs/{cid}")));

        let ipns = ContentHash::new(multicodec(IPNS_CODEC, &cid));
        assert_eq!(ipns.dnslink_path(), Some(format!("/ipns/{cid}")));
    }

    #[test]
    fn dnslink_ignores_unknown_codecs() {
        let cid = Cid::try_from(SAMPLE_CID).expect("cid parse");
        assert_eq!(ContentHash::new(multicodec(0x55, &cid)).dnslink_path(), None);
        assert_eq!(ContentHash::new(vec![0x01]).dnslink_path(), None);
        assert_eq!(ContentHash::new(vec![0xe3]).dnslink_path(), None);
    }
}
