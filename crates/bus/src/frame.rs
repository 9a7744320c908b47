//! JSON frames exchanged between `RemoteBus` clients and the hub.

use serde::{Deserialize, Serialize};

use crate::bus::BusMessage;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// client → hub
    Pub {
        topic: String,
        #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// client → hub. Re-sending a live `sid` replaces that subscription.
    Sub { sid: u64, pattern: String },
    /// client → hub
    Unsub { sid: u64 },
    /// hub → client, once the subscription is routed.
    SubAck { sid: u64 },
    /// hub → client
    Msg {
        sid: u64,
        topic: String,
        #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// hub → client
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<u64>,
        message: String,
    },
}

impl Frame {
    pub fn publish(message: BusMessage) -> Self {
        Frame::Pub {
            topic: message.topic,
            reply_to: message.reply_to,
            payload: message.payload,
        }
    }

    pub fn deliver(sid: u64, message: BusMessage) -> Self {
        Frame::Msg {
            sid,
            topic: message.topic,
            reply_to: message.reply_to,
            payload: message.payload,
        }
    }
}
