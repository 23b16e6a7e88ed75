//! The signed-message pipeline
//!
//! A `SignedMessage` pairs a decoded `RkSyncMessage` with the envelope it
//! travels in. The envelope payload is the canonical encoding; signatures
//! always cover those exact bytes, so for channel-restricted messages the
//! channel field is integrity-protected along with the content.

use crate::messages::*;
use prost::Message;
use skein_model::{ChainMac, PkiId};
use std::fmt;

/// Signs a payload with the local node's key.
pub type Signer<'a> = &'a dyn Fn(&[u8]) -> Result<Vec<u8>, ProtoError>;

/// Verifies a signature claimed by `pki_id` over `message`.
pub type Verifier<'a> = &'a dyn Fn(&PkiId, &[u8], &[u8]) -> Result<(), ProtoError>;

/// Errors of the wire pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("envelope has no payload")]
    EmptyPayload,

    #[error("message is not signed")]
    Unsigned,

    #[error("malformed identity blob")]
    MalformedIdentity,

    #[error("illegal tag: {0}")]
    IllegalTag(String),

    #[error(transparent)]
    Crypto(#[from] skein_model::CryptoError),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// A message together with its wire envelope.
#[derive(Clone, PartialEq)]
pub struct SignedMessage {
    pub message: RkSyncMessage,
    pub envelope: Envelope,
}

impl SignedMessage {
    /// Sign `message`, producing the envelope that carries it.
    pub fn sign(message: RkSyncMessage, signer: Signer<'_>) -> Result<Self, ProtoError> {
        let payload = message.encode_to_vec();
        let signature = signer(&payload)?;
        Ok(Self {
            message,
            envelope: Envelope { payload, signature },
        })
    }

    /// Wrap `message` in an unsigned envelope.
    ///
    /// Used for messages whose authenticity rides elsewhere: membership
    /// requests carry a signed self-information envelope inside, and probe
    /// pings carry nothing worth attesting.
    pub fn noop_sign(message: RkSyncMessage) -> Self {
        let payload = message.encode_to_vec();
        Self {
            message,
            envelope: Envelope {
                payload,
                signature: Vec::new(),
            },
        }
    }

    /// Verify the envelope signature under the claimed sender.
    pub fn verify(&self, pki_id: &PkiId, verifier: Verifier<'_>) -> Result<(), ProtoError> {
        if self.envelope.payload.is_empty() {
            return Err(ProtoError::EmptyPayload);
        }
        if self.envelope.signature.is_empty() {
            return Err(ProtoError::Unsigned);
        }
        verifier(pki_id, &self.envelope.payload, &self.envelope.signature)
    }

    pub fn is_signed(&self) -> bool {
        !self.envelope.signature.is_empty()
    }

    /// Enforce the tag-legality rule: channel-restricted content requires
    /// `CHAN_ONLY` and a channel; discovery content requires `EMPTY`.
    pub fn is_tag_legal(&self) -> Result<(), ProtoError> {
        let msg = &self.message;
        let restricted = msg.is_channel_restricted_content();
        match (restricted, msg.tag) {
            (true, t) if t == Tag::ChanOnly as i32 => {
                if msg.channel.is_empty() {
                    Err(ProtoError::IllegalTag(
                        "channel-restricted message without a channel".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            (true, _) => Err(ProtoError::IllegalTag(
                "channel-restricted content requires the CHAN_ONLY tag".into(),
            )),
            (false, t) if t == Tag::Empty as i32 => Ok(()),
            (false, _) => Err(ProtoError::IllegalTag(
                "discovery content requires the EMPTY tag".into(),
            )),
        }
    }
}

impl fmt::Debug for SignedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignedMessage({:?}, {} payload bytes, {})",
            self.message.content_kind(),
            self.envelope.payload.len(),
            if self.is_signed() {
                "signed"
            } else {
                "unsigned"
            }
        )
    }
}

impl Envelope {
    /// Decode the payload back into a `SignedMessage`.
    pub fn to_signed_message(&self) -> Result<SignedMessage, ProtoError> {
        if self.payload.is_empty() {
            return Err(ProtoError::EmptyPayload);
        }
        let message = RkSyncMessage::decode(&self.payload[..])?;
        Ok(SignedMessage {
            message,
            envelope: self.clone(),
        })
    }
}

impl RkSyncMessage {
    pub fn alive(&self) -> Option<&AliveMessage> {
        match &self.content {
            Some(Content::AliveMsg(a)) => Some(a),
            _ => None,
        }
    }

    pub fn mem_req(&self) -> Option<&MembershipRequest> {
        match &self.content {
            Some(Content::MemReq(r)) => Some(r),
            _ => None,
        }
    }

    pub fn mem_res(&self) -> Option<&MembershipResponse> {
        match &self.content {
            Some(Content::MemRes(r)) => Some(r),
            _ => None,
        }
    }

    pub fn chain_state(&self) -> Option<&ChainState> {
        match &self.content {
            Some(Content::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn conn_establish(&self) -> Option<&ConnEstablish> {
        match &self.content {
            Some(Content::Conn(c)) => Some(c),
            _ => None,
        }
    }

    pub fn is_alive_msg(&self) -> bool {
        self.alive().is_some()
    }

    pub fn is_chain_state_msg(&self) -> bool {
        self.chain_state().is_some()
    }

    /// Discovery-plane messages: alive, membership request, membership
    /// response.
    pub fn is_discovery_msg(&self) -> bool {
        matches!(
            self.content,
            Some(Content::AliveMsg(_)) | Some(Content::MemReq(_)) | Some(Content::MemRes(_))
        )
    }

    /// Channel-restricted content other than the chain state itself.
    pub fn is_channel_restricted(&self) -> bool {
        matches!(
            self.content,
            Some(Content::StatePullRequest(_))
                | Some(Content::StatePullResponse(_))
                | Some(Content::StateInfo(_))
        )
    }

    fn is_channel_restricted_content(&self) -> bool {
        self.is_chain_state_msg() || self.is_channel_restricted()
    }

    /// The chain MAC a channel-scoped message is routed by.
    pub fn chain_mac(&self) -> Option<ChainMac> {
        let mac = match &self.content {
            Some(Content::State(s)) => &s.chain_mac,
            Some(Content::StatePullRequest(r)) => &r.chain_mac,
            Some(Content::StatePullResponse(r)) => &r.chain_mac,
            _ => return None,
        };
        ChainMac::from_slice(mac)
    }

    /// Short name of the content variant, for logging.
    pub fn content_kind(&self) -> &'static str {
        match &self.content {
            Some(Content::AliveMsg(_)) => "alive",
            Some(Content::Empty(_)) => "empty",
            Some(Content::Conn(_)) => "conn_establish",
            Some(Content::Ack(_)) => "ack",
            Some(Content::MemReq(_)) => "membership_request",
            Some(Content::MemRes(_)) => "membership_response",
            Some(Content::State(_)) => "chain_state",
            Some(Content::StatePullRequest(_)) => "chain_state_pull_request",
            Some(Content::StatePullResponse(_)) => "chain_state_pull_response",
            Some(Content::StateInfo(_)) => "chain_state_info",
            None => "none",
        }
    }
}

impl ChainState {
    /// Decode the signed `ChainStateInfo` this state carries.
    pub fn chain_state_info(&self) -> Result<ChainStateInfo, ProtoError> {
        let envelope = self.envelope.as_ref().ok_or(ProtoError::EmptyPayload)?;
        let signed = envelope.to_signed_message()?;
        match signed.message.content {
            Some(Content::StateInfo(info)) => Ok(info),
            _ => Err(ProtoError::IllegalTag(
                "chain state envelope does not carry state info".into(),
            )),
        }
    }
}
