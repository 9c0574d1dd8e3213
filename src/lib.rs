//! A secret-sharing and partially-homomorphic computation layer for
//! coordinated training of linear models across mutually distrusting
//! parties.
//!
//! A guest (features and labels), a host (additional features for the same
//! rows) and an arbiter (decryption capability, no data) jointly compute dot
//! products, gradients and aggregations without revealing their private
//! inputs. Real tensors are encoded as scaled integers, split into additive
//! shares or pushed into Paillier ciphertexts, and recombined only at
//! explicitly chosen destination ranks.
//!
//! ## Main Components
//!
//! * [`channel`]: the tagged channel fabric with per-group monotonic message
//!   counters and collectives, on top of a pluggable [`transport`].
//! * [`fixedpoint`] and [`tensor`]: the fixed-point codec and the dense
//!   matrix types it encodes.
//! * [`share`] and [`phe`]: additive arithmetic shares and the Paillier
//!   cipher with scale-tracked ciphertext tensors.
//! * [`sshe`] and [`layer`]: the masked homomorphic multiplication
//!   protocols and the two-party secure linear layer built on them.
//! * [`glm`]: the guest/host/arbiter coordinated training loop for
//!   logistic, linear and Poisson regression.
//! * [`simulate`]: an in-process multi-party harness for tests and
//!   experiments.
//!
//! ## Basic Usage
//!
//! Each party constructs a [`session::Session`] describing the ranks, wraps
//! its transport in a [`channel::Communicator`] and runs its role's
//! protocol functions against it. For a single-process simulation:
//!
//! ```ignore
//! use troika::simulate::simulate;
//!
//! let outputs = simulate(2, |mut comm| async move {
//!     // rank-dependent protocol code, e.g. a secure forward pass
//!     comm.rank()
//! })
//! .await?;
//! ```
//!
//! ## Security Properties
//!
//! The protocols are semi-honest: parties follow the protocol but try to
//! learn from what they observe. Raw inputs never cross the wire; only
//! ciphertexts, freshly masked ciphertexts and explicitly revealed outputs
//! do. Message counters on both sides of every exchange must advance in
//! lockstep, and any desynchronization is treated as fatal for the session.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod data;
pub mod fixedpoint;
pub mod glm;
pub mod layer;
pub mod optim;
pub mod phe;
pub mod session;
pub mod share;
pub mod simulate;
pub mod sshe;
pub mod tensor;
pub mod transport;
