//! Index definitions: how a record maps to composite key components.
//!
//! A definition is either a list of dot-delimited field paths or a custom
//! reducer. Definitions are compiled once when registered, so malformed
//! paths are rejected before the pipeline opens.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::model::{KeyComponent, LogCursor, Record, Value};

/// Custom key derivation. Receives the record and its log's cursor as it was
/// when the record was read. Returning `Ok(None)` leaves the record out of
/// the index.
pub type KeyReducer =
    Arc<dyn Fn(&Record, &LogCursor) -> Result<Option<Vec<KeyComponent>>> + Send + Sync>;

/// What to derive index keys from.
#[derive(Clone)]
pub enum IndexDefinition {
    /// Dot-delimited field paths such as `"topic"` or `"meta.type"`.
    Fields(Vec<String>),
    Reducer(KeyReducer),
}

impl IndexDefinition {
    pub fn fields<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexDefinition::Fields(paths.into_iter().map(Into::into).collect())
    }

    pub fn reducer<F>(reducer: F) -> Self
    where
        F: Fn(&Record, &LogCursor) -> Result<Option<Vec<KeyComponent>>> + Send + Sync + 'static,
    {
        IndexDefinition::Reducer(Arc::new(reducer))
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexDefinition::Fields(paths) => f.debug_tuple("Fields").field(paths).finish(),
            IndexDefinition::Reducer(_) => f.write_str("Reducer(..)"),
        }
    }
}

/// Behavior when a field path does not resolve on a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingFieldPolicy {
    /// Report [`Error::MissingField`] through the pipeline's index-error event.
    #[default]
    FailFast,
    /// Leave the record out of this index without reporting anything.
    Skip,
}

/// Per-index options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    pub missing: MissingFieldPolicy,

    /// Append the log's numeric id and the record's sequence to field-path
    /// keys, so records sharing every field value remain distinct entries.
    /// Ignored for reducers, which append [`tie_break`] themselves if needed.
    pub tie_break: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            missing: MissingFieldPolicy::default(),
            tie_break: true,
        }
    }
}

/// Trailing components that make a key unique per record.
///
/// Encoded as fixed-width big-endian bytes, so entries sharing every other
/// component sort by log numeric id and then by sequence.
pub fn tie_break(cursor: &LogCursor, sequence: u64) -> [KeyComponent; 2] {
    [
        KeyComponent::Bytes(Bytes::copy_from_slice(&cursor.numeric_id.to_be_bytes())),
        KeyComponent::Bytes(Bytes::copy_from_slice(&sequence.to_be_bytes())),
    ]
}

/// A field path compiled into its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::Configuration("field path must not be empty".to_string()));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(Error::Configuration(format!(
                "field path '{}' contains an empty segment",
                path
            )));
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolves against the payload, then the metadata. `Null` counts as
    /// unresolved.
    pub fn resolve<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        [&record.payload, &record.metadata]
            .into_iter()
            .filter_map(|root| root.get_path(&self.segments))
            .find(|value| !value.is_null())
    }
}

enum Deriver {
    Fields(Vec<FieldPath>),
    Reducer(KeyReducer),
}

/// A registered index definition, ready to derive keys.
pub(crate) struct CompiledIndex {
    name: String,
    deriver: Deriver,
    options: IndexOptions,
}

impl CompiledIndex {
    pub(crate) fn compile(
        name: &str,
        definition: IndexDefinition,
        options: IndexOptions,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::Configuration("index name must not be empty".to_string()));
        }
        let deriver = match definition {
            IndexDefinition::Fields(paths) => {
                if paths.is_empty() {
                    return Err(Error::Configuration(format!(
                        "index '{}' needs at least one field path",
                        name
                    )));
                }
                Deriver::Fields(
                    paths
                        .iter()
                        .map(|path| FieldPath::parse(path))
                        .collect::<Result<_>>()?,
                )
            }
            IndexDefinition::Reducer(reducer) => Deriver::Reducer(reducer),
        };
        Ok(Self {
            name: name.to_string(),
            deriver,
            options,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Derives the key components for `record`, or `None` if the record is
    /// left out of this index.
    pub(crate) fn derive(
        &self,
        record: &Record,
        cursor: &LogCursor,
    ) -> Result<Option<Vec<KeyComponent>>> {
        match &self.deriver {
            Deriver::Reducer(reducer) => reducer(record, cursor),
            Deriver::Fields(paths) => {
                let mut components = Vec::with_capacity(paths.len() + 2);
                for path in paths {
                    let Some(value) = path.resolve(record) else {
                        return match self.options.missing {
                            MissingFieldPolicy::FailFast => Err(Error::MissingField {
                                index: self.name.clone(),
                                field: path.as_str().to_string(),
                            }),
                            MissingFieldPolicy::Skip => Ok(None),
                        };
                    };
                    components.push(KeyComponent::try_from(value)?);
                }
                if self.options.tie_break {
                    components.extend(tie_break(cursor, record.sequence));
                }
                Ok(Some(components))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::LogId;

    fn cursor() -> LogCursor {
        LogCursor {
            log_id: LogId::from("feed"),
            numeric_id: 2,
            next_sequence: 0,
        }
    }

    fn record(payload: serde_json::Value) -> Record {
        Record::new("feed", 9, payload)
    }

    fn compile(definition: IndexDefinition, options: IndexOptions) -> CompiledIndex {
        CompiledIndex::compile("idx", definition, options).unwrap()
    }

    #[test]
    fn should_reject_malformed_field_paths() {
        assert!(matches!(FieldPath::parse(""), Err(Error::Configuration(_))));
        assert!(matches!(FieldPath::parse("a..b"), Err(Error::Configuration(_))));
        assert!(matches!(FieldPath::parse(".a"), Err(Error::Configuration(_))));
        assert!(FieldPath::parse("a.b").is_ok());
    }

    #[test]
    fn should_reject_definition_without_fields() {
        // given
        let definition = IndexDefinition::fields(Vec::<String>::new());

        // when
        let result = CompiledIndex::compile("idx", definition, IndexOptions::default());

        // then
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn should_derive_fields_with_tie_break() {
        // given
        let index = compile(
            IndexDefinition::fields(["topic", "meta.type"]),
            IndexOptions::default(),
        );
        let record = record(json!({ "topic": "news", "meta": { "type": "post" } }));

        // when
        let key = index.derive(&record, &cursor()).unwrap().unwrap();

        // then
        let mut expected = vec![KeyComponent::from("news"), KeyComponent::from("post")];
        expected.extend(tie_break(&cursor(), 9));
        assert_eq!(key, expected);
    }

    #[test]
    fn should_fall_back_to_metadata() {
        // given
        let index = compile(
            IndexDefinition::fields(["type"]),
            IndexOptions {
                tie_break: false,
                ..Default::default()
            },
        );
        let record = record(json!({ "type": null })).with_metadata(json!({ "type": "chat" }));

        // when
        let key = index.derive(&record, &cursor()).unwrap();

        // then
        assert_eq!(key, Some(vec![KeyComponent::from("chat")]));
    }

    #[test]
    fn should_fail_fast_on_missing_field() {
        // given
        let index = compile(IndexDefinition::fields(["topic"]), IndexOptions::default());

        // when
        let result = index.derive(&record(json!({ "other": 1 })), &cursor());

        // then
        assert_eq!(
            result,
            Err(Error::MissingField {
                index: "idx".to_string(),
                field: "topic".to_string(),
            })
        );
    }

    #[test]
    fn should_skip_missing_field_when_configured() {
        // given
        let index = compile(
            IndexDefinition::fields(["topic"]),
            IndexOptions {
                missing: MissingFieldPolicy::Skip,
                tie_break: true,
            },
        );

        // when
        let result = index.derive(&record(json!({})), &cursor());

        // then
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn should_reject_non_scalar_field() {
        // given
        let index = compile(IndexDefinition::fields(["score"]), IndexOptions::default());

        // when
        let result = index.derive(&record(json!({ "score": 1.5 })), &cursor());

        // then
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn should_pass_cursor_to_reducer() {
        // given
        let index = compile(
            IndexDefinition::reducer(|record, cursor| {
                let mut key = vec![KeyComponent::from("all")];
                key.extend(tie_break(cursor, record.sequence));
                Ok(Some(key))
            }),
            IndexOptions::default(),
        );

        // when
        let key = index.derive(&record(json!({})), &cursor()).unwrap().unwrap();

        // then
        assert_eq!(key.len(), 3);
        assert_eq!(key[1], KeyComponent::Bytes(Bytes::from_static(&[0, 0, 0, 2])));
    }
}
