//! Signature checks for bmap documents.
//!
//! The engine never handles keys. It decides what needs verifying (a detached
//! signature, an OpenPGP clear-signed document, or nothing at all) and asks an
//! injected [`TrustStore`] for the answer.

use std::io;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};

const CLEARSIGN_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";

/// Key lookup and cryptographic verification, provided by the caller.
pub trait TrustStore: Send + Sync {
    /// Checks a detached `signature` over the exact `document` bytes.
    fn verify_detached(&self, document: &[u8], signature: &[u8]) -> io::Result<bool>;

    /// Checks a complete clear-signed `message`, armor included.
    fn verify_clearsigned(&self, message: &[u8]) -> io::Result<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
    Unsigned,
}

/// Returns whether `bytes` is an OpenPGP clear-signed message.
pub fn is_clearsigned(bytes: &[u8]) -> bool {
    bytes
        .trim_ascii_start()
        .starts_with(CLEARSIGN_BEGIN.as_bytes())
}

/// Extracts the signed text of a clear-signed message: armor headers are
/// dropped, dash-escaping is undone and every line ends with `\n`.
pub fn clearsigned_text(bytes: &[u8]) -> Result<Vec<u8>> {
    let malformed = |msg: &str| Error::MalformedDocument(format!("Clear-signed document: {msg}"));

    let text = std::str::from_utf8(bytes).map_err(|_| malformed("not UTF-8"))?;
    let mut lines = text
        .trim_start()
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l));

    if lines.next() != Some(CLEARSIGN_BEGIN) {
        return Err(malformed("missing header"));
    }

    // Armor headers ("Hash: SHA256") run until the first empty line.
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
    }

    let mut out = String::new();
    for line in lines {
        if line == SIGNATURE_BEGIN {
            return Ok(out.into_bytes());
        }
        out.push_str(line.strip_prefix("- ").unwrap_or(line));
        out.push('\n');
    }

    Err(malformed("missing signature block"))
}

/// Asks `trust_store` about the document. A detached signature takes
/// precedence; otherwise a clear-signed document is checked as a whole.
pub fn verify(
    document_bytes: &[u8],
    signature_bytes: Option<&[u8]>,
    trust_store: &dyn TrustStore,
) -> Result<Verdict> {
    let store_failed = |e: io::Error| Error::SignatureInvalid(format!("Trust store failed: {e}"));

    let valid = match signature_bytes {
        Some(signature) => trust_store
            .verify_detached(document_bytes, signature)
            .map_err(store_failed)?,
        None if is_clearsigned(document_bytes) => trust_store
            .verify_clearsigned(document_bytes)
            .map_err(store_failed)?,
        None => return Ok(Verdict::Unsigned),
    };

    Ok(if valid { Verdict::Valid } else { Verdict::Invalid })
}

/// Applies the signature policy chosen by the caller.
#[derive(Clone)]
pub struct SignatureVerifier {
    trust_store: Option<Arc<dyn TrustStore>>,
}

impl SignatureVerifier {
    /// Every document must carry a signature that `trust_store` accepts.
    pub fn enforcing(trust_store: Arc<dyn TrustStore>) -> Self {
        Self {
            trust_store: Some(trust_store),
        }
    }

    /// Signatures are not checked at all.
    pub fn disabled() -> Self {
        Self { trust_store: None }
    }

    pub fn is_enforcing(&self) -> bool {
        self.trust_store.is_some()
    }

    /// Checks the document against the policy and returns the bytes to parse:
    /// the cleartext for a clear-signed document, the input otherwise.
    pub fn authenticate(&self, bytes: &[u8], signature: Option<&[u8]>) -> Result<Vec<u8>> {
        let document = if is_clearsigned(bytes) {
            clearsigned_text(bytes)?
        } else {
            bytes.to_vec()
        };

        let Some(trust_store) = &self.trust_store else {
            warn!("Bmap signature verification is disabled");
            return Ok(document);
        };

        match verify(bytes, signature, trust_store.as_ref())? {
            Verdict::Valid => {
                info!("Successfully verified bmap file signature");
                Ok(document)
            }
            Verdict::Invalid => Err(Error::SignatureInvalid(
                "Discovered a bad signature for the bmap file".to_owned(),
            )),
            Verdict::Unsigned => Err(Error::SignatureInvalid(
                "The bmap file is not signed".to_owned(),
            )),
        }
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Accepts a detached signature equal to the reversed document, and any
    /// clear-signed message whose signature block contains `GOOD`.
    pub(crate) struct FakeTrustStore;

    impl TrustStore for FakeTrustStore {
        fn verify_detached(&self, document: &[u8], signature: &[u8]) -> io::Result<bool> {
            let mut reversed = document.to_vec();
            reversed.reverse();
            Ok(reversed == signature)
        }

        fn verify_clearsigned(&self, message: &[u8]) -> io::Result<bool> {
            let text = String::from_utf8_lossy(message);
            let block = text.split(SIGNATURE_BEGIN).nth(1).unwrap_or_default();
            Ok(block.contains("GOOD"))
        }
    }

    pub(crate) fn fake_signature(document: &[u8]) -> Vec<u8> {
        let mut sig = document.to_vec();
        sig.reverse();
        sig
    }

    fn clearsign(text: &str, verdict: &str) -> String {
        let escaped = text
            .lines()
            .map(|l| if l.starts_with('-') { format!("- {l}") } else { l.to_owned() })
            .collect::<Vec<_>>()
            .join("\r\n");
        format!(
            "{CLEARSIGN_BEGIN}\r\nHash: SHA256\r\n\r\n{escaped}\r\n{SIGNATURE_BEGIN}\r\n{verdict}\r\n-----END PGP SIGNATURE-----\r\n"
        )
    }

    #[test]
    fn extracts_cleartext() {
        let message = clearsign("<bmap>\n--dashes\n</bmap>", "GOOD");
        assert!(is_clearsigned(message.as_bytes()));
        assert_eq!(
            clearsigned_text(message.as_bytes()).unwrap(),
            b"<bmap>\n--dashes\n</bmap>\n"
        );
    }

    #[test]
    fn truncated_clearsign_is_malformed() {
        let message = format!("{CLEARSIGN_BEGIN}\nHash: SHA256\n\n<bmap/>\n");
        assert_matches!(
            clearsigned_text(message.as_bytes()),
            Err(Error::MalformedDocument(_))
        );
    }

    #[test]
    fn verdicts() {
        let doc = b"<bmap/>";
        let store = FakeTrustStore;

        assert_eq!(verify(doc, None, &store).unwrap(), Verdict::Unsigned);
        assert_eq!(
            verify(doc, Some(&fake_signature(doc)), &store).unwrap(),
            Verdict::Valid
        );
        assert_eq!(verify(doc, Some(b"nope"), &store).unwrap(), Verdict::Invalid);

        let good = clearsign("<bmap/>", "GOOD");
        let bad = clearsign("<bmap/>", "BAD");
        assert_eq!(verify(good.as_bytes(), None, &store).unwrap(), Verdict::Valid);
        assert_eq!(verify(bad.as_bytes(), None, &store).unwrap(), Verdict::Invalid);
    }

    #[test]
    fn enforcement() {
        let doc = b"<bmap/>".as_slice();
        let enforcing = SignatureVerifier::enforcing(Arc::new(FakeTrustStore));
        let disabled = SignatureVerifier::disabled();

        assert_matches!(
            enforcing.authenticate(doc, None),
            Err(Error::SignatureInvalid(_))
        );
        assert_matches!(
            enforcing.authenticate(doc, Some(b"forged")),
            Err(Error::SignatureInvalid(_))
        );
        assert_eq!(
            enforcing.authenticate(doc, Some(&fake_signature(doc))).unwrap(),
            doc
        );

        assert_eq!(disabled.authenticate(doc, None).unwrap(), doc);
        assert_eq!(disabled.authenticate(doc, Some(b"forged")).unwrap(), doc);

        let good = clearsign("<bmap/>", "GOOD");
        assert_eq!(enforcing.authenticate(good.as_bytes(), None).unwrap(), b"<bmap/>\n");
        assert_eq!(disabled.authenticate(good.as_bytes(), None).unwrap(), b"<bmap/>\n");
    }
}
