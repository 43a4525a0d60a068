use crate::domain::request::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MerchantAccountStatus,
    NewMessage,
    OfferUpdate,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::MerchantAccountStatus => "merchant_account_status",
            NotificationKind::NewMessage => "new_message",
            NotificationKind::OfferUpdate => "offer_update",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push notification the engine wants delivered once state has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub recipient: UserId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
}

impl NotificationIntent {
    pub fn new(
        recipient: UserId,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            recipient,
            title: title.into(),
            message: message.into(),
            kind,
        }
    }
}
