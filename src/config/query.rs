use super::version::VersionedSql;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;

/// How a result column is turned into metrics.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Usage {
    /// Ignore this column
    #[default]
    #[serde(alias = "discard")]
    Discard,
    /// Use this column as a label
    #[serde(alias = "label")]
    Label,
    /// Use this column as a counter
    #[serde(alias = "counter")]
    Counter,
    /// Use this column as a gauge
    #[serde(alias = "gauge")]
    Gauge,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub description: String,
}

/// A named query with its column mapping, ready to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub variants: Vec<VersionedSql>,
    pub metrics: BTreeMap<String, Metric>,
    pub name_column: Option<String>,
    pub value_column: Option<String>,
}

impl Query {
    /// Columns whose usage is [`Usage::Label`].
    pub fn label_columns(&self) -> impl Iterator<Item = &str> {
        self.metrics
            .iter()
            .filter(|(_, m)| m.usage == Usage::Label)
            .map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn metric(&self, column: &str) -> Option<&Metric> {
        self.metrics.get(column)
    }

    /// The `(name_column, value_column)` pair when the query names its
    /// metrics from row values.
    #[must_use]
    pub fn name_value_columns(&self) -> Option<(&str, &str)> {
        match (&self.name_column, &self.value_column) {
            (Some(name), Some(value)) => Some((name.as_str(), value.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SqlText {
    Single(String),
    Versioned(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryDef {
    query: SqlText,
    #[serde(default)]
    metrics: BTreeMap<String, Metric>,
    name_column: Option<String>,
    value_column: Option<String>,
}

impl QueryDef {
    fn into_query(self, name: String) -> Result<Query> {
        let name_column = self.name_column.filter(|s| !s.is_empty());
        let value_column = self.value_column.filter(|s| !s.is_empty());

        if name_column.is_some() && value_column.is_none() {
            bail!("query {name:?}: name_column requires value_column");
        }

        let variants = match self.query {
            SqlText::Single(sql) => vec![VersionedSql::unbounded(sql)],
            SqlText::Versioned(map) => map
                .into_iter()
                .map(|(range, sql)| VersionedSql::from_range(&range, sql))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("query {name:?}"))?,
        };

        if variants.is_empty() {
            bail!("query {name:?} has no SQL text");
        }

        Ok(Query {
            name,
            variants,
            metrics: self.metrics,
            name_column,
            value_column,
        })
    }
}

/// Parse the contents of a query file: one table per query, keyed by name.
///
/// # Errors
///
/// Returns an error if the TOML is invalid or a query breaks an invariant.
pub fn parse_queries(content: &str) -> Result<Vec<Query>> {
    let defs: BTreeMap<String, QueryDef> = toml::from_str(content)?;

    defs.into_iter()
        .map(|(name, def)| def.into_query(name))
        .collect()
}
