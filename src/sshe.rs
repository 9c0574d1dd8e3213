//! Two-party secure matrix multiplication over additive shares and Paillier
//! ciphertexts.
//!
//! The building block is a masked homomorphic product: one party encrypts
//! its factor, the peer multiplies the ciphertext by its own plaintext
//! factor, blinds the result with a fresh statistical mask (see
//! [`CipherMatrix::blind`]) and returns it. After decryption the two
//! parties hold ring shares of the product; neither raw factor ever crosses
//! the wire, and the opened value is wider than any product by a
//! statistical margin. Every mask is drawn fresh per call, since a reused
//! mask lets the peer take the difference of two outputs.
//!
//! Both sides of each protocol consume tensor send/recv indices in
//! lockstep; a mismatch desynchronizes the channel fabric and is fatal for
//! the session.

use rand::Rng;
use thiserror::Error;

use crate::channel::{ChannelError, Communicator};
use crate::fixedpoint::FixedPointEncoder;
use crate::phe::{CipherMatrix, PheCipher, PheError, PhePublicKey};
use crate::share::{ArithmeticShare, ShareError};
use crate::tensor::{IntMatrix, Matrix};
use crate::transport::Transport;

/// Default Paillier modulus width for production sessions. Tests use
/// shorter keys to stay fast.
pub const DEFAULT_KEY_BITS: u64 = 1024;

/// Errors raised by the secure multiplication protocols.
#[derive(Debug, Error)]
pub enum SsheError {
    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A cipher operation failed.
    #[error(transparent)]
    Phe(#[from] PheError),
    /// A share operation failed.
    #[error(transparent)]
    Share(#[from] ShareError),
    /// The local rank is neither of the two protocol roles.
    #[error("rank {rank} has no role in this protocol instance")]
    NoRole {
        /// The local rank.
        rank: usize,
    },
    /// The caller's role requires an input it did not provide.
    #[error("missing local protocol input: {0}")]
    MissingInput(&'static str),
    /// The protocols are strictly two-party.
    #[error("the active group must have exactly 2 ranks, got {0}")]
    NotTwoParty(usize),
    /// A received ciphertext carries the wrong number of scale factors; the
    /// peer ran a different protocol step.
    #[error("peer ciphertext carries scale^{actual}, expected scale^{expected}")]
    PeerScaleMismatch {
        /// The scale power this step produces.
        expected: u32,
        /// The scale power the peer sent.
        actual: u32,
    },
}

/// The local party's Paillier capabilities for one two-party pairing: its
/// own full keypair and the peer's public key.
#[derive(Debug, Clone)]
pub struct CipherPair {
    /// The full local keypair.
    pub own: PheCipher,
    /// The peer's encrypt-only capability.
    pub peer: PheCipher,
}

/// The rank of the other member of the active two-party group.
pub fn peer_rank<T: Transport>(comm: &Communicator<T>) -> Result<usize, SsheError> {
    let ranks = comm.active_ranks();
    if ranks.len() != 2 {
        return Err(SsheError::NotTwoParty(ranks.len()));
    }
    ranks
        .into_iter()
        .find(|r| *r != comm.rank())
        .ok_or(SsheError::NoRole { rank: comm.rank() })
}

/// Generates a fresh keypair and swaps public keys with the peer of the
/// active two-party group, consuming one object send and one object recv
/// index on each side.
pub async fn exchange_keys<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    bits: u64,
    rng: &mut R,
) -> Result<CipherPair, SsheError> {
    let peer = peer_rank(comm)?;
    let own = PheCipher::generate(bits, rng)?;
    comm.send_obj(&own.public, peer).await?;
    let peer_pk: PhePublicKey = comm.recv_obj(peer).await?;
    Ok(CipherPair {
        own,
        peer: PheCipher::from_public(peer_pk),
    })
}

/// Which side of the matrix product the ciphertext factor sits on.
#[derive(Debug, Clone, Copy)]
enum MulOrder {
    /// `cipher @ own`
    CipherLeft,
    /// `own @ cipher`
    CipherRight,
}

/// Keyholder side of the masked product: encrypts `own`, receives the
/// blinded product and decrypts it. The result is this party's raw share of
/// the product at two scale factors.
async fn masked_matmul_key_side<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    cipher: &PheCipher,
    own: &IntMatrix,
    peer: usize,
    rng: &mut R,
) -> Result<IntMatrix, SsheError> {
    let ct = cipher.encrypt_matrix(own, 1, rng);
    comm.send(&ct, peer).await?;
    let masked: CipherMatrix = comm.recv(peer).await?;
    if masked.scale_pow() != 2 {
        return Err(SsheError::PeerScaleMismatch {
            expected: 2,
            actual: masked.scale_pow(),
        });
    }
    Ok(cipher.decrypt_matrix(&masked)?)
}

/// Multiplying side of the masked product: multiplies the received
/// ciphertext by its own plaintext factor in the given order, blinds the
/// result and returns it. The ring share of the blinding masks is this
/// party's raw share of the product at two scale factors.
async fn masked_matmul_mul_side<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    peer_key: &PheCipher,
    own: &IntMatrix,
    order: MulOrder,
    peer: usize,
    rng: &mut R,
) -> Result<IntMatrix, SsheError> {
    let ct: CipherMatrix = comm.recv(peer).await?;
    let pk = &peer_key.public;
    let product = match order {
        MulOrder::CipherLeft => ct.matmul_right(own, pk)?,
        MulOrder::CipherRight => CipherMatrix::matmul_left(own, &ct, pk)?,
    };
    let (blinded, mask_share) = product.blind(pk, rng);
    comm.send(&blinded, peer).await?;
    Ok(mask_share)
}

/// Secure product of two encoded factors held by different parties, without
/// the final rescale: `tensor_a @ tensor_b` as additive shares carrying two
/// scale factors. `rank_a` holds `tensor_a` and the decryption key;
/// `rank_b` holds `tensor_b`. The caller truncates once before mixing the
/// result with single-scale shares.
pub async fn smm_lc<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    tensor_a: Option<&IntMatrix>,
    tensor_b: Option<&IntMatrix>,
    rank_a: usize,
    rank_b: usize,
    ciphers: &CipherPair,
    rng: &mut R,
) -> Result<ArithmeticShare, SsheError> {
    let raw = if comm.rank() == rank_a {
        let ta = tensor_a.ok_or(SsheError::MissingInput("smm_lc tensor_a"))?;
        masked_matmul_key_side(comm, &ciphers.own, ta, rank_b, rng).await?
    } else if comm.rank() == rank_b {
        let tb = tensor_b.ok_or(SsheError::MissingInput("smm_lc tensor_b"))?;
        masked_matmul_mul_side(comm, &ciphers.peer, tb, MulOrder::CipherLeft, rank_a, rng).await?
    } else {
        return Err(SsheError::NoRole { rank: comm.rank() });
    };
    Ok(ArithmeticShare::from_encoded(raw, 2))
}

/// Like [`smm`] but without the final rescale: the shares stay at two scale
/// factors so a caller can sum several product terms before truncating the
/// sum once.
async fn smm_unscaled<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    x: Option<&IntMatrix>,
    y: Option<&ArithmeticShare>,
    input_rank: usize,
    key_rank: usize,
    ciphers: &CipherPair,
    rng: &mut R,
) -> Result<ArithmeticShare, SsheError> {
    let raw = if comm.rank() == key_rank {
        let y = y.ok_or(SsheError::MissingInput("smm keyholder share"))?;
        masked_matmul_key_side(comm, &ciphers.own, y.encoded(), input_rank, rng).await?
    } else if comm.rank() == input_rank {
        let x = x.ok_or(SsheError::MissingInput("smm input tensor"))?;
        masked_matmul_mul_side(comm, &ciphers.peer, x, MulOrder::CipherRight, key_rank, rng).await?
    } else {
        return Err(SsheError::NoRole { rank: comm.rank() });
    };
    Ok(ArithmeticShare::from_encoded(raw, 2))
}

/// Secure product `x @ y` of a plaintext-encoded input at `input_rank` and
/// an encoded share at `key_rank`, rescaled to single-scale shares.
///
/// The keyholder encrypts its share; the input holder multiplies from the
/// left and blinds. Each side truncates its raw share once, so the
/// recombined result is at a single scale within one truncation ulp per
/// party.
pub async fn smm<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    x: Option<&IntMatrix>,
    y: Option<&ArithmeticShare>,
    input_rank: usize,
    key_rank: usize,
    ciphers: &CipherPair,
    encoder: &FixedPointEncoder,
    rng: &mut R,
) -> Result<ArithmeticShare, SsheError> {
    let share = smm_unscaled(comm, x, y, input_rank, key_rank, ciphers, rng).await?;
    Ok(share.truncate(encoder))
}

/// Secure bilinear form `xa @ wa + xb @ wb` as single-scale additive shares.
///
/// `rank_a` holds the plaintext `xa`, `rank_b` holds `xb`; `wa` and `wb`
/// are each additively shared, with every caller passing its own share of
/// both blocks. Three terms per side: the local product with the own weight
/// share, and one exchange per cross term, executed in the same order on
/// both ranks so the tag counters stay in lockstep. All three terms are
/// summed at two scale factors and truncated once per party, so the
/// recombined output is within one truncation ulp per party.
#[allow(clippy::too_many_arguments)]
pub async fn cross_smm<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    ciphers: &CipherPair,
    xa: Option<&Matrix>,
    xb: Option<&Matrix>,
    wa: &ArithmeticShare,
    wb: &ArithmeticShare,
    rank_a: usize,
    rank_b: usize,
    encoder: &FixedPointEncoder,
    rng: &mut R,
) -> Result<ArithmeticShare, SsheError> {
    let sum = if comm.rank() == rank_a {
        let xa = xa.ok_or(SsheError::MissingInput("cross_smm xa"))?;
        let xa_enc = encoder.encode(xa);
        let local = ArithmeticShare::from_encoded(xa_enc.matmul(wa.encoded()), 2);
        let cross_a = smm_unscaled(comm, Some(&xa_enc), None, rank_a, rank_b, ciphers, rng).await?;
        let cross_b = smm_unscaled(comm, None, Some(wb), rank_b, rank_a, ciphers, rng).await?;
        local.add(&cross_a)?.add(&cross_b)?
    } else if comm.rank() == rank_b {
        let xb = xb.ok_or(SsheError::MissingInput("cross_smm xb"))?;
        let xb_enc = encoder.encode(xb);
        let local = ArithmeticShare::from_encoded(xb_enc.matmul(wb.encoded()), 2);
        let cross_a = smm_unscaled(comm, None, Some(wa), rank_a, rank_b, ciphers, rng).await?;
        let cross_b = smm_unscaled(comm, Some(&xb_enc), None, rank_b, rank_a, ciphers, rng).await?;
        local.add(&cross_a)?.add(&cross_b)?
    } else {
        return Err(SsheError::NoRole { rank: comm.rank() });
    };
    Ok(sum.truncate(encoder))
}

/// Input gradients of the secure linear layer: `rank_a` ends up with the
/// plaintext `dz @ waᵀ` and `rank_b` with `dz @ wbᵀ`, where `dz` is the
/// upstream gradient held encoded at `rank_b` only.
///
/// `rank_a` decrypts both exchanges under its own key. The second exchange
/// is blinded by `rank_b` with a fresh statistical mask before it reaches
/// the decryptor, so `rank_a` learns nothing about `dz @ wbᵀ`; the opened
/// value is returned to `rank_b`, which adds its mask share and its local
/// term. Both directions carry exactly two encoded factors and are decoded
/// at two scale powers.
#[allow(clippy::too_many_arguments)]
pub async fn input_gradients<T: Transport, R: Rng>(
    comm: &mut Communicator<T>,
    ciphers: &CipherPair,
    wa: &ArithmeticShare,
    wb: &ArithmeticShare,
    dz_encoded: Option<&IntMatrix>,
    rank_a: usize,
    rank_b: usize,
    encoder: &FixedPointEncoder,
    rng: &mut R,
) -> Result<Matrix, SsheError> {
    if comm.rank() == rank_a {
        let ct_wa = ciphers
            .own
            .encrypt_matrix(&wa.encoded().transpose(), 1, rng);
        comm.send(&ct_wa, rank_b).await?;
        let enc_dha: CipherMatrix = comm.recv(rank_b).await?;
        let dha = encoder.decode_scaled(&ciphers.own.decrypt_matrix(&enc_dha)?, 2);

        let ct_wb = ciphers
            .own
            .encrypt_matrix(&wb.encoded().transpose(), 1, rng);
        comm.send(&ct_wb, rank_b).await?;
        let enc_dhb: CipherMatrix = comm.recv(rank_b).await?;
        let blinded = ciphers.own.decrypt_matrix(&enc_dhb)?;
        comm.send(&blinded, rank_b).await?;
        Ok(dha)
    } else if comm.rank() == rank_b {
        let dz = dz_encoded.ok_or(SsheError::MissingInput("input_gradients dz"))?;
        let pk = &ciphers.peer.public;

        let ct_wa: CipherMatrix = comm.recv(rank_a).await?;
        let local_a = dz.matmul(&wa.encoded().transpose());
        let enc_dha = CipherMatrix::matmul_left(dz, &ct_wa, pk)?.add_plain(&local_a, pk)?;
        comm.send(&enc_dha, rank_a).await?;

        let ct_wb: CipherMatrix = comm.recv(rank_a).await?;
        let partial = CipherMatrix::matmul_left(dz, &ct_wb, pk)?;
        let (enc_dhb, mask_share) = partial.blind(pk, rng);
        comm.send(&enc_dhb, rank_a).await?;
        let opened: IntMatrix = comm.recv(rank_a).await?;
        let dhb = opened
            .add(&mask_share)
            .add(&dz.matmul(&wb.encoded().transpose()));
        Ok(encoder.decode_scaled(&dhb, 2))
    } else {
        Err(SsheError::NoRole { rank: comm.rank() })
    }
}
