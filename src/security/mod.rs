//! Security module for sender pairing and access control

pub mod pairing;

pub use pairing::{
    AuthDecision, DmPolicy, DropReason, PAIRED_REPLY, PairingSettings, SenderEvent,
    SenderRecord, SenderStatus, SenderStore,
};
