//! Verification of clear-signed dsc files against a set of keyrings.
//!
//! This wraps the [sequoia_openpgp] streaming verifier behind the one
//! question the importer asks: who signed this dsc, out of which
//! keyring, when, and how well. The verifier helper collects every
//! signature outcome instead of failing fast, so that a signature from
//! an expired or revoked key can still be imported (annotated on the
//! upload tag) while unknown keys and broken signatures stay fatal.

use sequoia_openpgp::{
    cert::CertParser,
    packet::Signature,
    parse::{
        stream::{MessageLayer, MessageStructure, VerificationError, VerificationHelper, VerifierBuilder},
        Parse,
    },
    policy::StandardPolicy,
    Cert, Fingerprint, KeyHandle, KeyID, Result as SequoiaResult,
};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

/// A named keyring file. The name is the file stem
/// (`debian-keyring-2024` or the synthetic `local` trust keyring) and
/// ends up in upload tag annotations.
#[derive(Debug, Clone)]
pub struct Keyring {
    pub name: String,
    pub path: PathBuf,
}

/// Signature quality in gpgv vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigStatus {
    Good,
    ExpiredKey,
    RevokedKey,
    Bad,
    UnknownKey,
}

impl std::fmt::Display for SigStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            SigStatus::Good => "GOODSIG",
            SigStatus::ExpiredKey => "EXPKEYSIG",
            SigStatus::RevokedKey => "REVKEYSIG",
            SigStatus::Bad => "BADSIG",
            SigStatus::UnknownKey => "NOKEY",
        })
    }
}

/// The gate's verdict on one dsc.
#[derive(Debug, Clone)]
pub struct DscSignature {
    /// Name of the keyring the signing key came from.
    pub keyring: String,
    /// 16-hex key id of the signing (sub)key.
    pub key_id: String,
    /// Signer name, if the user id carried one.
    pub signer_name: Option<String>,
    /// Signer email, possibly repaired via an `email=` override.
    pub signer_email: String,
    /// Signature creation time, unix seconds.
    pub time: i64,
    pub status: SigStatus,
}

impl DscSignature {
    /// `Name <email>` form for fast-import tagger lines. The name part
    /// is empty for bare-email identities.
    pub fn tagger_ident(&self) -> String {
        match &self.signer_name {
            Some(name) => format!("{} <{}>", name, self.signer_email),
            None => format!("<{}>", self.signer_email),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// No keyrings are configured at all; verification is impossible.
    NoKeyrings,
    /// The signing key is in no configured keyring and no `trust=`
    /// override covers it.
    UnknownKey { key_id: String },
    /// The signature exists but does not check out.
    BadSignature { key_id: String },
    /// The message carries no signature at all.
    Unsigned,
    /// The signer's user id is neither `Name <email>` nor a bare email,
    /// and no `email=` override repairs it.
    MalformedIdentity { key_id: String, userid: String },
    Io(std::io::Error),
    OpenPgp(anyhow::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NoKeyrings => write!(
                f,
                "no keyrings found; run deb-fetch-keyrings to install the distribution keyrings"
            ),
            Error::UnknownKey { key_id } => write!(
                f,
                "signature by unknown key {}; pass trust={} to accept it from your gpg keyring",
                key_id, key_id
            ),
            Error::BadSignature { key_id } => write!(f, "bad signature by key {}", key_id),
            Error::Unsigned => write!(f, "dsc is not signed"),
            Error::MalformedIdentity { key_id, userid } => write!(
                f,
                "cannot parse user id {:?} of key {}; pass email={} <address> to repair it",
                userid, key_id, key_id
            ),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::OpenPgp(e) => write!(f, "OpenPGP error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// One observed signature, as collected by the verifier helper.
enum Outcome {
    /// The signature verified against a key we hold. The status notes
    /// degraded key state.
    Verified {
        fingerprint: Fingerprint,
        sig: Signature,
        status: SigStatus,
    },
    Unknown {
        key_id: String,
    },
    Bad {
        key_id: String,
    },
}

#[derive(Debug)]
pub struct SignatureGate {
    /// Every (sub)key handle, primary fingerprint and key id alike,
    /// mapped to its cert and the name of the keyring that held it.
    by_fingerprint: HashMap<Fingerprint, (Cert, String)>,
    by_keyid: HashMap<KeyID, (Cert, String)>,
    email_overrides: HashMap<String, String>,
}

impl SignatureGate {
    pub fn new(
        keyrings: &[Keyring],
        email_overrides: HashMap<String, String>,
    ) -> Result<Self, Error> {
        if keyrings.is_empty() {
            return Err(Error::NoKeyrings);
        }
        let mut by_fingerprint = HashMap::new();
        let mut by_keyid = HashMap::new();
        for keyring in keyrings {
            for cert in CertParser::from_file(&keyring.path).map_err(Error::OpenPgp)? {
                let cert = cert.map_err(Error::OpenPgp)?;
                for key in cert.keys() {
                    let fpr = key.key().fingerprint();
                    by_keyid.insert(KeyID::from(&fpr), (cert.clone(), keyring.name.clone()));
                    by_fingerprint.insert(fpr, (cert.clone(), keyring.name.clone()));
                }
            }
        }
        Ok(SignatureGate {
            by_fingerprint,
            by_keyid,
            email_overrides,
        })
    }

    fn lookup(&self, sig: &Signature) -> Option<&(Cert, String)> {
        for issuer in sig.get_issuers() {
            let entry = match &issuer {
                KeyHandle::Fingerprint(fpr) => self.by_fingerprint.get(fpr),
                KeyHandle::KeyID(kid) => self.by_keyid.get(kid),
            };
            if entry.is_some() {
                return entry;
            }
        }
        None
    }

    /// Verify one clear-signed dsc. Returns the signature verdict and
    /// the cleartext payload.
    pub fn verify(&self, raw: &[u8]) -> Result<(DscSignature, Vec<u8>), Error> {
        let policy = &StandardPolicy::new();

        struct Helper<'a> {
            gate: &'a SignatureGate,
            policy: &'a StandardPolicy<'a>,
            outcomes: Vec<Outcome>,
        }

        impl Helper<'_> {
            fn issuer_id(sig: &Signature) -> String {
                sig.get_issuers()
                    .into_iter()
                    .next()
                    .map(|h| match h {
                        KeyHandle::Fingerprint(fpr) => KeyID::from(&fpr).to_hex(),
                        KeyHandle::KeyID(kid) => kid.to_hex(),
                    })
                    .unwrap_or_else(|| "unknown".to_owned())
            }

            /// Classify a signature whose key we hold but which the
            /// policy would not accept: revoked beats expired.
            fn degraded_status(&self, cert: &Cert) -> SigStatus {
                use sequoia_openpgp::types::RevocationStatus;
                if let RevocationStatus::Revoked(_) = cert.revocation_status(self.policy, None) {
                    return SigStatus::RevokedKey;
                }
                SigStatus::ExpiredKey
            }

            fn record(&mut self, sig: &Signature, good: bool) {
                match self.gate.lookup(sig) {
                    Some((cert, _)) => {
                        let status = if good {
                            SigStatus::Good
                        } else {
                            self.degraded_status(cert)
                        };
                        self.outcomes.push(Outcome::Verified {
                            fingerprint: cert.fingerprint(),
                            sig: sig.clone(),
                            status,
                        });
                    }
                    None => self.outcomes.push(Outcome::Unknown {
                        key_id: Self::issuer_id(sig),
                    }),
                }
            }
        }

        impl VerificationHelper for &mut Helper<'_> {
            fn get_certs(&mut self, _ids: &[KeyHandle]) -> SequoiaResult<Vec<Cert>> {
                Ok(self
                    .gate
                    .by_fingerprint
                    .values()
                    .map(|(cert, _)| cert.clone())
                    .collect())
            }

            fn check(&mut self, structure: MessageStructure) -> SequoiaResult<()> {
                for layer in structure.into_iter() {
                    let results = match layer {
                        MessageLayer::SignatureGroup { results } => results,
                        _ => continue,
                    };
                    for result in results {
                        match result {
                            Ok(good) => self.record(good.sig, true),
                            Err(VerificationError::MissingKey { sig, .. }) => {
                                let key_id = Helper::issuer_id(sig);
                                self.outcomes.push(Outcome::Unknown { key_id });
                            }
                            Err(VerificationError::UnboundKey { sig, .. })
                            | Err(VerificationError::BadKey { sig, .. }) => {
                                self.record(sig, false)
                            }
                            Err(VerificationError::BadSignature { sig, .. })
                            | Err(VerificationError::MalformedSignature { sig, .. }) => {
                                let key_id = Helper::issuer_id(sig);
                                self.outcomes.push(Outcome::Bad { key_id });
                            }
                            Err(_) => self.outcomes.push(Outcome::Bad {
                                key_id: "unknown".to_owned(),
                            }),
                        }
                    }
                }
                Ok(())
            }
        }

        let mut helper = Helper {
            gate: self,
            policy,
            outcomes: vec![],
        };

        let mut verifier = VerifierBuilder::from_bytes(raw)
            .map_err(Error::OpenPgp)?
            .with_policy(policy, None, &mut helper)
            .map_err(Error::OpenPgp)?;
        let mut cleartext = vec![];
        verifier.read_to_end(&mut cleartext)?;

        let Helper { outcomes, .. } = helper;
        let verdict = self.best_outcome(outcomes)?;
        Ok((verdict, cleartext))
    }

    /// Pick the most favorable of the observed signatures; a dsc
    /// normally carries exactly one.
    fn best_outcome(&self, outcomes: Vec<Outcome>) -> Result<DscSignature, Error> {
        let mut best: Option<(Fingerprint, Signature, SigStatus)> = None;
        let mut unknown: Option<String> = None;
        let mut bad: Option<String> = None;
        for outcome in outcomes {
            match outcome {
                Outcome::Verified {
                    fingerprint,
                    sig,
                    status,
                } => {
                    let better = match &best {
                        Some((_, _, b)) => status == SigStatus::Good && *b != SigStatus::Good,
                        None => true,
                    };
                    if better {
                        best = Some((fingerprint, sig, status));
                    }
                }
                Outcome::Unknown { key_id } => unknown = Some(key_id),
                Outcome::Bad { key_id } => bad = Some(key_id),
            }
        }
        let (fingerprint, sig, status) = match best {
            Some(b) => b,
            None => {
                if let Some(key_id) = bad {
                    return Err(Error::BadSignature { key_id });
                }
                if let Some(key_id) = unknown {
                    return Err(Error::UnknownKey { key_id });
                }
                return Err(Error::Unsigned);
            }
        };

        let (cert, keyring) = self
            .by_fingerprint
            .get(&fingerprint)
            .expect("verified fingerprint is in the map");
        let key_id = KeyID::from(&fingerprint).to_hex();
        let (signer_name, signer_email) = self.signer_identity(cert, &key_id)?;
        let time = sig
            .signature_creation_time()
            .map(|t| {
                let dt: chrono::DateTime<chrono::Utc> = t.into();
                dt.timestamp()
            })
            .unwrap_or(0);
        Ok(DscSignature {
            keyring: keyring.clone(),
            key_id,
            signer_name,
            signer_email,
            time,
            status,
        })
    }

    /// Extract `(name, email)` from the cert's first user id,
    /// tolerating bare-email identities and applying `email=` repairs.
    fn signer_identity(
        &self,
        cert: &Cert,
        key_id: &str,
    ) -> Result<(Option<String>, String), Error> {
        let userid = match cert.userids().next() {
            Some(ua) => ua.userid().clone(),
            None => {
                return match self.email_overrides.get(key_id) {
                    Some(email) => Ok((None, email.clone())),
                    None => Err(Error::MalformedIdentity {
                        key_id: key_id.to_owned(),
                        userid: String::new(),
                    }),
                }
            }
        };
        let name = userid.name().ok().flatten();
        let email = userid
            .email()
            .ok()
            .flatten()
            .or_else(|| self.email_overrides.get(key_id).cloned());
        match email {
            Some(email) => Ok((name, email)),
            None => {
                // A user id that is just an address parses as a name
                // with no email in some producers; accept it as a bare
                // email.
                let value = String::from_utf8_lossy(userid.value()).to_string();
                if value.contains('@') && !value.contains(' ') {
                    Ok((None, value))
                } else {
                    Err(Error::MalformedIdentity {
                        key_id: key_id.to_owned(),
                        userid: value,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(SigStatus::Good.to_string(), "GOODSIG");
        assert_eq!(SigStatus::ExpiredKey.to_string(), "EXPKEYSIG");
        assert_eq!(SigStatus::UnknownKey.to_string(), "NOKEY");
    }

    #[test]
    fn test_tagger_ident() {
        let sig = DscSignature {
            keyring: "debian-keyring".into(),
            key_id: "0123456789ABCDEF".into(),
            signer_name: Some("Jane Doe".into()),
            signer_email: "jane@debian.org".into(),
            time: 1_100_000_000,
            status: SigStatus::Good,
        };
        assert_eq!(sig.tagger_ident(), "Jane Doe <jane@debian.org>");
        let bare = DscSignature {
            signer_name: None,
            ..sig
        };
        assert_eq!(bare.tagger_ident(), "<jane@debian.org>");
    }

    #[test]
    fn test_empty_keyring_set_is_fatal() {
        let err = SignatureGate::new(&[], HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::NoKeyrings));
    }
}
