//! Privacy-preserving reward receipts: blind issuance of unlinkable
//! receipts, single verification with double-spend protection, and batched
//! aggregate verification over the BLS12-381 pairing, together with the
//! packet codec and transport that expose the scheme as a small binary RPC
//! service.

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Gt, Scalar, pairing};
use ff::Field;
use group::Group;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

pub mod cbor;
pub mod ledger;
pub mod net;

#[cfg(test)]
mod tests;

pub use ledger::SerialLedger;

/// Canonical byte length of a serial number (a scalar field element).
pub const SERIAL_LEN: usize = 32;
/// Byte length of a compressed G1 element.
pub const G1_LEN: usize = 48;
/// Byte length of a compressed G2 element.
pub const G2_LEN: usize = 96;

const HASH_TO_G1_DST: &[u8] = b"reward-receipts-v1 BLS12381G1_XMD:SHA-256_SSWU_RO_";

/// Digest used to hash a serial before mapping it into G1. The choice fixes
/// the digest length fed into hash-to-group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlg {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha224 => Sha224::digest(bytes).to_vec(),
            HashAlg::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlg::Sha384 => Sha384::digest(bytes).to_vec(),
            HashAlg::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

/// Public scheme parameters: the two source-group generators and the digest
/// choice. Immutable once constructed. A helper adopts the issuer's
/// parameters rather than generating its own.
#[derive(Clone, Debug)]
pub struct Params {
    hash: HashAlg,
    g1: G1Projective,
    g2: G2Projective,
}

impl Params {
    pub fn new(hash: HashAlg, g1: G1Projective, g2: G2Projective) -> Self {
        Params { hash, g1, g2 }
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    pub fn g1(&self) -> &G1Projective {
        &self.g1
    }

    pub fn g2(&self) -> &G2Projective {
        &self.g2
    }

    /// Maps a serial into G1: digest its canonical bytes with the configured
    /// hash, then run the digest through hash-to-curve.
    pub fn hash_to_g1(&self, s: &Scalar) -> G1Projective {
        let digest = self.hash.digest(&s.to_bytes());
        <G1Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(&digest, HASH_TO_G1_DST)
    }
}

/// Issuer verification key.
///
/// `y2 = g2^x` is the key the pairing checks run against and the component
/// the wire protocol calls `y`. `y1 = g1^x` is what a helper needs to strip
/// its blinding factor during finalization; on a symmetric pairing the two
/// components coincide.
#[derive(Clone, Copy, Debug)]
pub struct PublicKey {
    y1: G1Projective,
    y2: G2Projective,
}

impl PublicKey {
    pub fn new(y1: G1Projective, y2: G2Projective) -> Self {
        PublicKey { y1, y2 }
    }

    pub fn y1(&self) -> &G1Projective {
        &self.y1
    }

    pub fn y2(&self) -> &G2Projective {
        &self.y2
    }
}

/// Helper-side state for one receipt issuance. The serial and the blinding
/// factor never leave this struct; only the blinded element is sent to the
/// issuer, which is what keeps the issued receipt unlinkable.
pub struct PreReceipt {
    s: Scalar,
    r: Scalar,
    h: G1Projective,
}

impl PreReceipt {
    /// The value `h = g1^r * H(s)` to send to the issuer for blind signing.
    pub fn blinded(&self) -> &G1Projective {
        &self.h
    }
}

/// A finished receipt: the serial together with `sigma = H(s)^x`.
pub struct Receipt {
    s: Scalar,
    sigma: G1Projective,
}

impl Receipt {
    pub fn serial(&self) -> &Scalar {
        &self.s
    }

    pub fn serial_bytes(&self) -> [u8; SERIAL_LEN] {
        self.s.to_bytes()
    }

    pub fn sigma(&self) -> &G1Projective {
        &self.sigma
    }
}

/// The issuer role: holds the secret scalar and performs blind signing. The
/// embedded [`Verifier`] carries the public parameters and the serial ledger
/// that the server-side verification operations run against.
pub struct Issuer {
    x: Scalar,
    public: PublicKey,
    verifier: Verifier,
}

impl Issuer {
    /// Key generation: random generators, random secret `x`, `y = g^x`.
    pub fn random(hash: HashAlg, mut rng: impl CryptoRngCore) -> Self {
        let g1 = G1Projective::random(&mut rng);
        let g2 = G2Projective::random(&mut rng);
        Self::keygen(Params::new(hash, g1, g2), rng)
    }

    /// Key generation over adopted parameters, for deployments where several
    /// issuers share generators so their receipts can be aggregated.
    pub fn with_params(params: Params, rng: impl CryptoRngCore) -> Self {
        Self::keygen(params, rng)
    }

    fn keygen(params: Params, mut rng: impl CryptoRngCore) -> Self {
        let x = Scalar::random(&mut rng);
        let public = PublicKey::new(params.g1 * x, params.g2 * x);
        Issuer {
            x,
            public,
            verifier: Verifier::new(params),
        }
    }

    /// The blind-signing step: `psi = h^x`. The issuer learns neither the
    /// serial nor the blinding factor, and the ledger is untouched.
    pub fn blind_sign(&self, h: &G1Projective) -> G1Projective {
        h * self.x
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn params(&self) -> &Params {
        self.verifier.params()
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }
}

/// The helper/verifier role: public parameters plus the ledger of consumed
/// serials. Never holds the issuer's secret.
pub struct Verifier {
    params: Params,
    ledger: SerialLedger,
}

impl Verifier {
    pub fn new(params: Params) -> Self {
        Verifier {
            params,
            ledger: SerialLedger::new(),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn ledger(&self) -> &SerialLedger {
        &self.ledger
    }

    /// Issuance step 1: draw a fresh serial `s` (redrawing while the ledger
    /// already contains it) and a blinding factor `r`, and compute
    /// `h = g1^r * H(s)`. Only `h` ever goes to the issuer.
    pub fn prepare(&self, mut rng: impl CryptoRngCore) -> PreReceipt {
        let mut s = Scalar::random(&mut rng);
        while self.ledger.contains(&s.to_bytes()) {
            s = Scalar::random(&mut rng);
        }
        let r = Scalar::random(&mut rng);
        let h = self.params.g1 * r + self.params.hash_to_g1(&s);
        PreReceipt { s, r, h }
    }

    /// Issuance step 3: `sigma = y^(-r) * psi`, cancelling the blinding
    /// factor so that `sigma = H(s)^x` without the issuer having seen `s`.
    pub fn finalize(&self, pre: &PreReceipt, psi: &G1Projective, key: &PublicKey) -> Receipt {
        Receipt {
            s: pre.s,
            sigma: psi - key.y1 * pre.r,
        }
    }

    /// Checks a single receipt: malformed or oversized serial bytes fail,
    /// a replayed serial fails, and otherwise the pairing equation
    /// `e(sigma, g2) == e(H(s), y)` decides.
    ///
    /// The serial is recorded in the ledger only when the pairing check
    /// passes, and recording is an atomic insert-if-absent, so of any set of
    /// concurrent verifications of one serial exactly one returns true.
    pub fn verify(&self, sigma: &G1Projective, serial: &[u8], y: &G2Projective) -> bool {
        let Some(s) = decode_serial(serial) else {
            return false;
        };
        if self.ledger.contains(&s.to_bytes()) {
            return false;
        }
        let lhs = pairing(&G1Affine::from(sigma), &G2Affine::from(&self.params.g2));
        let rhs = pairing(&G1Affine::from(self.params.hash_to_g1(&s)), &G2Affine::from(y));
        lhs == rhs && self.ledger.insert(s.to_bytes())
    }

    /// Folds per-receipt signatures into one element by group addition. The
    /// accumulator lives in G1, the group of the signatures themselves.
    pub fn aggregate(&self, sigmas: &[G1Projective]) -> G1Projective {
        sigmas
            .iter()
            .fold(G1Projective::identity(), |acc, sigma| acc + sigma)
    }

    /// Checks an aggregated signature against its serials and keys:
    /// `prod e(H(s_i), y_i) == e(sigmaAgg, g2)`. Any replayed or malformed
    /// serial, or a length mismatch between the lists, fails the whole
    /// batch. Serials checked here are deliberately not recorded; batch
    /// verification leaves them eligible for individual verification.
    pub fn aggregate_verify(
        &self,
        sigma_agg: &G1Projective,
        serials: &[Vec<u8>],
        keys: &[G2Projective],
    ) -> bool {
        if serials.len() != keys.len() {
            return false;
        }
        let mut comp = Gt::identity();
        for (serial, y) in serials.iter().zip(keys) {
            let Some(s) = decode_serial(serial) else {
                return false;
            };
            if self.ledger.contains(&s.to_bytes()) {
                return false;
            }
            comp += pairing(&G1Affine::from(self.params.hash_to_g1(&s)), &G2Affine::from(y));
        }
        comp == pairing(&G1Affine::from(sigma_agg), &G2Affine::from(&self.params.g2))
    }
}

/// Serial bytes are accepted up to the canonical width and zero-padded on
/// the high end; anything longer, or a non-canonical encoding, is rejected.
fn decode_serial(bytes: &[u8]) -> Option<Scalar> {
    if bytes.len() > SERIAL_LEN {
        return None;
    }
    let mut buf = [0u8; SERIAL_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Scalar::from_bytes(&buf).into()
}

#[test]
fn issue_and_verify() {
    use rand_core::OsRng;
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let helper = Verifier::new(issuer.params().clone());
    let pre = helper.prepare(OsRng);
    let psi = issuer.blind_sign(pre.blinded());
    let receipt = helper.finalize(&pre, &psi, issuer.public());
    assert!(helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
}
