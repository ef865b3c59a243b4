//! Wire protocol: framed JSON messages exchanged over mTLS (SPEC_FULL.md §6).
//!
//! Framing is `<length:u32 big-endian><payload:UTF-8 JSON>`, matching the
//! original `struct.pack('>I', len(msg))` framing. We reuse
//! `tokio_util::codec::LengthDelimitedCodec` rather than hand-rolling the
//! length prefix.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Builds the length-delimited codec used for both directions of the
/// protocol: 4-byte big-endian length header, no adjustment, no max-frame
/// cap beyond what the caller enforces at the application layer.
pub fn framing_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_type::<u32>()
        .new_codec()
}

/// Inbound job priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Priority {
    pub const ALL_DESCENDING: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

impl TryFrom<i64> for Priority {
    type Error = ();

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJobBody {
    #[serde(rename = "Priority")]
    pub priority: u8,
    #[serde(rename = "Ports")]
    pub ports: String,
    #[serde(rename = "CommsPort")]
    pub comms_port: u16,
}

/// Inbound request, tagged on `"Request"` so an unrecognized tag (or any
/// payload shape that doesn't match) fails to deserialize and is routed to
/// the invalid-request branch by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Request")]
pub enum InboundRequest {
    #[serde(rename = "New Job")]
    NewJob { #[serde(rename = "Job")] job: NewJobBody },
    #[serde(rename = "Terminate")]
    Terminate { #[serde(rename = "JobID")] job_id: i64 },
}

/// Outbound reply sent on the *same* connection the inbound request arrived
/// on (accept/refuse acknowledgements).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "Msg")]
pub enum ReplyMessage {
    Accepted {
        #[serde(rename = "RequestType")]
        request_type: &'static str,
        #[serde(rename = "JobID")]
        job_id: i64,
    },
    Refused {
        #[serde(rename = "Reason")]
        reason: String,
    },
    /// Reply to an early termination of a still-waiting job. Note the
    /// deliberately inconsistent casing of the original protocol (`JobId`
    /// here vs `JobID` everywhere else, and `Msg:"Terminated"` shared with
    /// the unrelated callback message) — preserved for wire compatibility.
    #[serde(rename = "Terminated")]
    TerminatedWaiting {
        #[serde(rename = "JobId")]
        job_id: i64,
        #[serde(rename = "Reason")]
        reason: &'static str,
    },
}

/// Outbound one-shot callback notification (core → client, new connection).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "Msg")]
pub enum CallbackMessage {
    Started {
        #[serde(rename = "JobID")]
        job_id: i64,
        #[serde(rename = "Ports")]
        ports: BTreeMap<String, u16>,
    },
    Terminated {
        #[serde(rename = "JobID")]
        job_id: i64,
        #[serde(rename = "Reason")]
        reason: String,
    },
}
