//! Job payload carried in queue messages
//!
//! Wire format:
//!
//! ```json
//! {"s3Location": "uploads/a.pdf", "user_id": "1", "screen_id": "9", "decrement": true}
//! ```
//!
//! Ids arrive as decimal strings; plain integers are accepted too. The
//! `decrement` flag is the retry marker set by the failure handler. Unknown
//! fields are kept so a re-published job carries them unchanged.

use crate::errors::IngestError;
use paperintake_common::cache::keys;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use validator::Validate;

/// Ingestion job decoded from a queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Job {
    /// Object key of the PDF in the upload bucket
    #[serde(rename = "s3Location")]
    #[validate(length(min = 1, message = "s3Location must not be empty"))]
    pub blob_location: String,

    #[serde(deserialize_with = "id_from_any", serialize_with = "id_as_string")]
    #[validate(range(min = 1, message = "user_id must be positive"))]
    pub user_id: i64,

    #[serde(deserialize_with = "id_from_any", serialize_with = "id_as_string")]
    #[validate(range(min = 1, message = "screen_id must be positive"))]
    pub screen_id: i64,

    /// Set once the job's failure has been logged and counted
    #[serde(rename = "decrement", default, deserialize_with = "flag_from_any")]
    pub retry_marker: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Decode and validate a message body
    pub fn decode(body: &str) -> Result<Self, IngestError> {
        let job: Job =
            serde_json::from_str(body).map_err(|e| IngestError::Malformed(e.to_string()))?;
        job.validate()
            .map_err(|e| IngestError::Malformed(e.to_string()))?;
        Ok(job)
    }

    /// Serialize back to the wire format
    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Copy of this job with the retry marker set
    pub fn marked_for_retry(&self) -> Self {
        Job {
            retry_marker: true,
            ..self.clone()
        }
    }

    /// Outstanding-work counter key for this job's screen
    pub fn counter_key(&self) -> String {
        keys::papers_processing(self.screen_id)
    }

    /// Marker guarding this file's single decrement of the counter
    pub fn settled_marker(&self) -> String {
        keys::job_settled(self.screen_id, &self.blob_location)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Text(String),
}

fn id_from_any<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match IdRepr::deserialize(deserializer)? {
        IdRepr::Int(id) => Ok(id),
        IdRepr::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| de::Error::custom(format!("invalid id {:?}", text))),
    }
}

fn id_as_string<S>(id: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&id.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagRepr {
    Bool(bool),
    Text(String),
    Null(()),
}

fn flag_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match FlagRepr::deserialize(deserializer)? {
        FlagRepr::Bool(flag) => flag,
        FlagRepr::Text(text) => text.eq_ignore_ascii_case("true"),
        FlagRepr::Null(()) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string_ids() {
        let job = Job::decode(r#"{"s3Location":"a.pdf","user_id":"1","screen_id":"9"}"#).unwrap();
        assert_eq!(job.blob_location, "a.pdf");
        assert_eq!(job.user_id, 1);
        assert_eq!(job.screen_id, 9);
        assert!(!job.retry_marker);
        assert_eq!(job.counter_key(), "screen:9:papers_processing");
        assert_eq!(job.settled_marker(), "screen:9:done:a.pdf");
    }

    #[test]
    fn test_decode_integer_ids_and_marker() {
        let job =
            Job::decode(r#"{"s3Location":"a.pdf","user_id":1,"screen_id":9,"decrement":true}"#)
                .unwrap();
        assert!(job.retry_marker);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = Job::decode(r#"{"s3Location":"a.pdf","user_id":"1"}"#).unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
    }

    #[test]
    fn test_zero_or_garbage_ids_are_malformed() {
        assert!(Job::decode(r#"{"s3Location":"a.pdf","user_id":"0","screen_id":"9"}"#).is_err());
        assert!(Job::decode(r#"{"s3Location":"a.pdf","user_id":"x","screen_id":"9"}"#).is_err());
        assert!(Job::decode(r#"{"s3Location":"","user_id":"1","screen_id":"9"}"#).is_err());
        assert!(Job::decode("not json").is_err());
    }

    #[test]
    fn test_republished_body_keeps_unknown_fields() {
        let job = Job::decode(
            r#"{"s3Location":"a.pdf","user_id":"1","screen_id":"9","upload_id":"u-7"}"#,
        )
        .unwrap();
        let body = job.marked_for_retry().to_body().unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["decrement"], Value::Bool(true));
        assert_eq!(value["user_id"], Value::String("1".into()));
        assert_eq!(value["upload_id"], Value::String("u-7".into()));

        let again = Job::decode(&body).unwrap();
        assert!(again.retry_marker);
        assert_eq!(again.extra.get("upload_id"), job.extra.get("upload_id"));
    }
}
