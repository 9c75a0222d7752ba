use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, Snafu};
use uuid::Uuid;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdError {
    #[snafu(display("id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type IdResult<T> = Result<T, IdError>;

macro_rules! define_chat_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> IdResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-chat-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(raw: &str) -> IdResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_chat_id!(DiscussionId, "discussion-id");
define_chat_id!(MessageId, "message-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_ids_and_rejects_garbage() {
        let raw = "1b4e28ba-2fa1-11d2-883f-0016d3cca427";
        let id = DiscussionId::parse(raw).unwrap();
        assert_eq!(id.to_string(), raw);
        assert_eq!(raw.parse::<DiscussionId>().unwrap(), id);

        let error = MessageId::parse("not-a-uuid").unwrap_err();
        assert!(error.to_string().contains("message-id"));
    }

    #[test]
    fn fresh_ids_are_unique() {
        assert_ne!(MessageId::new_v7(), MessageId::new_v7());
    }
}
