//! Read projections
//!
//! A read may narrow a record in two steps: a query expression picks a
//! sub-shape first, then an optional path selection pulls single values out
//! of that shape.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::path::FieldPath;

/// Query expression handed to a `QueryProjector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(String);

impl Query {
    pub fn parse(query: &str) -> Result<Self, StoreError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidQuery("query must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Query {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts a sub-shape of a record; must be free of side effects
pub trait QueryProjector: Send + Sync {
    fn project(&self, query: &Query, record: &Value) -> Result<Value, StoreError>;
}

/// Selection-set projector: `{ name money settings { theme } }`
///
/// Outer braces and commas are optional. Selected keys the record lacks come
/// back as `null`; a sub-selection on an array applies to every element.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionProjector;

#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    children: Option<Vec<Field>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Name(String),
}

fn tokenize(query: &str) -> Result<Vec<Token>, StoreError> {
    let mut tokens = Vec::new();
    let mut chars = query.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            ',' => {}
            c if c.is_whitespace() => {}
            c if c.is_alphanumeric() || c == '_' => {
                let mut name = c.to_string();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(name));
            }
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unexpected {:?} at offset {}",
                    other, pos
                )));
            }
        }
    }
    Ok(tokens)
}

/// Deepest selection nesting accepted
pub const MAX_QUERY_DEPTH: usize = 64;

fn parse_fields<I>(tokens: &mut I, depth: usize) -> Result<Vec<Field>, StoreError>
where
    I: Iterator<Item = Token>,
{
    let nested = depth > 0;
    let mut fields: Vec<Field> = Vec::new();
    loop {
        match tokens.next() {
            Some(Token::Name(name)) => fields.push(Field { name, children: None }),
            Some(Token::Open) => {
                if depth >= MAX_QUERY_DEPTH {
                    return Err(StoreError::InvalidQuery(format!(
                        "selections nest deeper than {}",
                        MAX_QUERY_DEPTH
                    )));
                }
                let parent = fields
                    .last_mut()
                    .filter(|f| f.children.is_none())
                    .ok_or_else(|| StoreError::InvalidQuery("selection without a field".into()))?;
                parent.children = Some(parse_fields(tokens, depth + 1)?);
            }
            Some(Token::Close) if nested => break,
            Some(Token::Close) => return Err(StoreError::InvalidQuery("unbalanced '}'".into())),
            None if nested => return Err(StoreError::InvalidQuery("unclosed '{'".into())),
            None => break,
        }
    }
    if fields.is_empty() {
        return Err(StoreError::InvalidQuery("empty selection".into()));
    }
    Ok(fields)
}

fn parse_selection(query: &str) -> Result<Vec<Field>, StoreError> {
    let mut tokens = tokenize(query)?;
    // Drop one pair of outer braces
    if tokens.first() == Some(&Token::Open) && tokens.last() == Some(&Token::Close) {
        tokens.remove(0);
        tokens.pop();
    }
    parse_fields(&mut tokens.into_iter(), 0)
}

fn select(fields: &[Field], value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|item| select(fields, item)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for field in fields {
                let child = map.get(&field.name).unwrap_or(&Value::Null);
                let projected = match &field.children {
                    Some(children) => select(children, child),
                    None => child.clone(),
                };
                out.insert(field.name.clone(), projected);
            }
            Value::Object(out)
        }
        _ => Value::Null,
    }
}

impl QueryProjector for SelectionProjector {
    fn project(&self, query: &Query, record: &Value) -> Result<Value, StoreError> {
        let fields = parse_selection(query.as_str())?;
        Ok(select(&fields, record))
    }
}

/// Which values a read returns after the query step
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PathSelection {
    /// The whole (possibly query-projected) record
    #[default]
    Whole,
    /// One value, `default` when the path is missing
    One { path: FieldPath, default: Value },
    /// One value per path, as an array
    Many(Vec<(FieldPath, Value)>),
}

/// Query projection followed by path selection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    pub query: Option<Query>,
    pub paths: PathSelection,
}

impl Projection {
    pub fn whole() -> Self {
        Self::default()
    }

    pub fn path(path: &str, default: Value) -> Result<Self, StoreError> {
        Ok(Self {
            query: None,
            paths: PathSelection::One {
                path: FieldPath::parse(path)?,
                default,
            },
        })
    }

    /// Several paths; missing defaults are `null`
    pub fn paths<S: AsRef<str>>(paths: &[S], defaults: Vec<Value>) -> Result<Self, StoreError> {
        let parsed = FieldPath::parse_all(paths)?;
        let mut defaults = defaults.into_iter();
        let pairs = parsed
            .into_iter()
            .map(|p| (p, defaults.next().unwrap_or(Value::Null)))
            .collect();
        Ok(Self {
            query: None,
            paths: PathSelection::Many(pairs),
        })
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Project one record value
    pub fn apply(&self, projector: &dyn QueryProjector, record: Value) -> Result<Value, StoreError> {
        let shaped = match &self.query {
            Some(query) => projector.project(query, &record)?,
            None => record,
        };
        Ok(match &self.paths {
            PathSelection::Whole => shaped,
            PathSelection::One { path, default } => lookup(&shaped, path, default),
            PathSelection::Many(pairs) => {
                Value::Array(pairs.iter().map(|(p, d)| lookup(&shaped, p, d)).collect())
            }
        })
    }
}

fn lookup(value: &Value, path: &FieldPath, default: &Value) -> Value {
    path.get(value).cloned().unwrap_or_else(|| default.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Value {
        json!({
            "userID": 42,
            "name": "Ada",
            "money": 70,
            "settings": {"theme": "dark", "lang": "en"},
            "data": {"items": [{"id": 1, "qty": 2}, {"id": 2, "qty": 5}]}
        })
    }

    fn project(query: &str) -> Result<Value, StoreError> {
        SelectionProjector.project(&Query::parse(query)?, &record())
    }

    #[test]
    fn test_flat_and_nested_selection() {
        assert_eq!(
            project("{ name money settings { theme } }").unwrap(),
            json!({"name": "Ada", "money": 70, "settings": {"theme": "dark"}})
        );
        assert_eq!(project("name, vanity").unwrap(), json!({"name": "Ada", "vanity": null}));
    }

    #[test]
    fn test_selection_maps_over_arrays() {
        assert_eq!(
            project("data { items { qty } }").unwrap(),
            json!({"data": {"items": [{"qty": 2}, {"qty": 5}]}})
        );
    }

    #[test]
    fn test_malformed_queries() {
        for query in ["{ name", "name }", "{ }", "{ name money", "{ { name } }", "name.x", "   "] {
            assert!(
                matches!(project(query), Err(StoreError::InvalidQuery(_))),
                "{:?} should be rejected",
                query
            );
        }
    }

    #[test]
    fn test_deep_selection_rejected() {
        let deep = "a{".repeat(200_000) + "x" + &"}".repeat(200_000);
        assert!(matches!(project(&deep), Err(StoreError::InvalidQuery(_))));

        let limit = "a{".repeat(MAX_QUERY_DEPTH) + "x" + &"}".repeat(MAX_QUERY_DEPTH);
        assert!(project(&limit).is_ok());
        let over = "a{".repeat(MAX_QUERY_DEPTH + 1) + "x" + &"}".repeat(MAX_QUERY_DEPTH + 1);
        assert!(matches!(project(&over), Err(StoreError::InvalidQuery(_))));
    }

    #[test]
    fn test_projection_query_then_path() {
        let projection = Projection::path("settings.theme", json!("light"))
            .unwrap()
            .with_query(Query::parse("settings { theme }").unwrap());
        assert_eq!(projection.apply(&SelectionProjector, record()).unwrap(), json!("dark"));

        let projection = Projection::path("settings.lang", json!("fallback"))
            .unwrap()
            .with_query(Query::parse("settings { theme }").unwrap());
        assert_eq!(projection.apply(&SelectionProjector, record()).unwrap(), json!("fallback"));
    }

    #[test]
    fn test_projection_many_paths_pads_defaults() {
        let projection = Projection::paths(&["money", "data.none", "exp"], vec![json!(0), json!("d")]).unwrap();
        assert_eq!(
            projection.apply(&SelectionProjector, record()).unwrap(),
            json!([70, "d", null])
        );
    }
}
