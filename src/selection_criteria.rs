use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the
    /// server type, max staleness, and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A
    /// `server` will be considered suitable by a `predicate` if
    /// `predicate(server)` returns true.
    Predicate(Predicate),
}

impl std::fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }

    /// A criteria that matches only the server at the given address. Used to
    /// route `getMore` and `killCursors` to the server that owns the cursor.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a
/// replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica
/// set, and `max_staleness` specifies the maximum lag behind the primary that a
/// secondary can be to remain eligible for the operation. The max staleness
/// value maps to the `maxStalenessSeconds` MongoDB option and will be sent to
/// the server as an integer number of seconds.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifications for the desired servers.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to
    /// the secondaries if not.
    PrimaryPreferred {
        /// Specifications for the desired servers.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back
    /// to the primary if not.
    SecondaryPreferred {
        /// Specifications for the desired servers.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency
    /// regardless of whether it's the primary or a secondary.
    Nearest {
        /// Specifications for the desired servers.
        options: ReadPreferenceOptions,
    },
}

/// Filters applied to non-primary read preference modes.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for the read
    /// operation. The first tag set that matches at least one server is used;
    /// an empty tag set (`{}`) matches any server.
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary
    /// can be to be considered for the operation. Must be at least 90 seconds.
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub(crate) fn mode_str(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn from_mode_str(mode: &str) -> Option<Self> {
        match mode.to_lowercase().as_str() {
            "primary" => Some(ReadPreference::Primary),
            "primarypreferred" => Some(ReadPreference::PrimaryPreferred {
                options: Default::default(),
            }),
            "secondary" => Some(ReadPreference::Secondary {
                options: Default::default(),
            }),
            "secondarypreferred" => Some(ReadPreference::SecondaryPreferred {
                options: Default::default(),
            }),
            "nearest" => Some(ReadPreference::Nearest {
                options: Default::default(),
            }),
            _ => None,
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|opts| opts.tag_sets.as_ref())
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|opts| opts.max_staleness)
    }

    pub(crate) fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let mut this = self;
        match this {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => {
                options.tag_sets = Some(tag_sets);
            }
        };
        Ok(this)
    }

    pub(crate) fn with_max_staleness(self, max_staleness: Duration) -> Result<Self> {
        let mut this = self;
        match this {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "max staleness can only be specified when a non-primary mode is specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => {
                options.max_staleness = Some(max_staleness);
            }
        };
        Ok(this)
    }

    /// Renders the read preference as the `$readPreference` document.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode_str() };

        if let Some(max_staleness) = self.max_staleness() {
            doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }

        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<Bson> = tag_sets
                .iter()
                .map(|tag_set| {
                    Bson::Document(
                        tag_set
                            .iter()
                            .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                            .collect(),
                    )
                })
                .collect();
            doc.insert("tags", tags);
        }

        doc
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_rendering() {
        let pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                tag_sets: Some(vec![[("dc".to_string(), "east".to_string())]
                    .into_iter()
                    .collect()]),
                max_staleness: Some(Duration::from_secs(120)),
            },
        };
        let doc = pref.to_document();
        assert_eq!(doc.get_str("mode").unwrap(), "secondary");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 120);
        assert_eq!(
            doc.get_array("tags").unwrap()[0],
            Bson::Document(doc! { "dc": "east" })
        );
    }

    #[test]
    fn tags_rejected_for_primary() {
        assert!(ReadPreference::Primary
            .with_tags(vec![TagSet::new()])
            .is_err());
    }
}
