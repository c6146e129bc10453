//! The database schema: tables, reducers and their fully resolved types.
//!
//! The schema is fetched as JSON from the database's `/schema` route and
//! parsed into [`Schema`]. The document carries a typespace (an ordered list
//! of type definitions referenced by index); parsing eagerly inlines every
//! reference, so the types held by a [`TableDef`] or [`ReducerDef`] never
//! contain an [`AlgebraicType::Ref`].

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value as Json;
use stdb_dyn_sats::{AlgebraicType, ProductTypeElement, SumTypeVariant};
use thiserror::Error;

/// A named, typed column of a table row or reducer parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: Box<str>,
    pub ty: AlgebraicType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: Box<str>,
    pub columns: Box<[Column]>,
    /// Indices into `columns`, in definition order. May be empty.
    pub primary_key: Box<[usize]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerDef {
    pub name: Box<str>,
    /// The parameter list, treated as an anonymous product for the wire.
    pub params: Box<[Column]>,
}

/// The parsed schema of one database.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<Box<str>, TableDef>,
    reducers: HashMap<Box<str>, ReducerDef>,
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema fetch failed with status {status}: {body}")]
    FetchFailed { status: u16, body: String },
    #[error("failed to request schema: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed schema document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed type in schema: {0}")]
    BadType(String),
    #[error("unresolved type ref {0}")]
    UnresolvedRef(u32),
    #[error("no such table `{0}`")]
    UnknownTable(Box<str>),
    #[error("no such reducer `{0}`")]
    UnknownReducer(Box<str>),
}

/// Refs may chain through the typespace; a chain longer than this is
/// reported as unresolvable rather than recursed into forever.
const MAX_REF_DEPTH: u32 = 64;

/// Fetches and parses the schema of `database` from `base`, where `base` is
/// an origin like `http://localhost:3000`. This is the one HTTP call the SDK
/// makes.
pub async fn fetch_schema(base: &str, database: &str) -> Result<Schema, SchemaError> {
    let url = format!("{base}/v1/database/{database}/schema?version=9");
    log::debug!("fetching schema from {url}");
    let response = reqwest::get(&url).await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(SchemaError::FetchFailed {
            status: status.as_u16(),
            body,
        });
    }
    Schema::parse(&body)
}

impl TableDef {
    /// The column indices to key cache entries on: the primary key, or the
    /// first column when the table declares none.
    pub fn key_columns(&self) -> &[usize] {
        static FIRST_COLUMN: [usize; 1] = [0];
        if self.primary_key.is_empty() {
            &FIRST_COLUMN
        } else {
            &self.primary_key
        }
    }
}

impl Schema {
    /// Parses a `/schema?version=9` JSON document.
    pub fn parse(document: &str) -> Result<Schema, SchemaError> {
        let raw: RawSchema = serde_json::from_str(document)?;

        let mut typespace = Vec::with_capacity(raw.typespace.types.len());
        for ty in &raw.typespace.types {
            typespace.push(parse_type(ty)?);
        }

        let mut tables = HashMap::with_capacity(raw.tables.len());
        for table in raw.tables {
            let ty = typespace
                .get(table.product_type_ref as usize)
                .ok_or(SchemaError::UnresolvedRef(table.product_type_ref))?;
            let ty = resolve(ty, &typespace, MAX_REF_DEPTH)?;
            let columns = columns_of(&ty, &table.name)?;
            let primary_key: Box<[usize]> = table.primary_key.iter().map(|&c| c as usize).collect();
            if primary_key.is_empty() {
                log::warn!(
                    "table `{}` declares no primary key; the cache will key on its first column",
                    table.name
                );
            }
            tables.insert(
                table.name.clone().into_boxed_str(),
                TableDef {
                    name: table.name.into(),
                    columns,
                    primary_key,
                },
            );
        }

        let mut reducers = HashMap::with_capacity(raw.reducers.len());
        for reducer in raw.reducers {
            let params = parse_type(&reducer.params)?;
            let params = resolve(&params, &typespace, MAX_REF_DEPTH)?;
            let params = columns_of(&params, &reducer.name)?;
            reducers.insert(
                reducer.name.clone().into_boxed_str(),
                ReducerDef {
                    name: reducer.name.into(),
                    params,
                },
            );
        }

        Ok(Schema { tables, reducers })
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn reducer(&self, name: &str) -> Option<&ReducerDef> {
        self.reducers.get(name)
    }

    pub fn columns_for(&self, table: &str) -> Result<&[Column], SchemaError> {
        self.tables
            .get(table)
            .map(|t| &*t.columns)
            .ok_or_else(|| SchemaError::UnknownTable(table.into()))
    }

    pub fn primary_key_for(&self, table: &str) -> Result<&[usize], SchemaError> {
        self.tables
            .get(table)
            .map(|t| &*t.primary_key)
            .ok_or_else(|| SchemaError::UnknownTable(table.into()))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| &**k)
    }

    /// Assembles a schema directly from definitions. Mostly useful in tests.
    pub fn from_defs(
        tables: impl IntoIterator<Item = TableDef>,
        reducers: impl IntoIterator<Item = ReducerDef>,
    ) -> Schema {
        Schema {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            reducers: reducers.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }
}

#[derive(Deserialize)]
struct RawSchema {
    typespace: RawTypespace,
    #[serde(default)]
    tables: Vec<RawTable>,
    #[serde(default)]
    reducers: Vec<RawReducer>,
}

#[derive(Deserialize)]
struct RawTypespace {
    #[serde(default)]
    types: Vec<Json>,
}

#[derive(Deserialize)]
struct RawTable {
    name: String,
    product_type_ref: u32,
    #[serde(default)]
    primary_key: Vec<u32>,
}

#[derive(Deserialize)]
struct RawReducer {
    name: String,
    params: Json,
}

/// Reads one algebraic type node.
///
/// Type nodes are single-key objects: `{"U64": []}`, `{"Ref": 3}`,
/// `{"Array": <elem>}`, `{"Product": {"elements": [...]}}`,
/// `{"Sum": {"variants": [...]}}`. Two shapes get special treatment: a sum
/// whose variants are `some`/`none` becomes [`AlgebraicType::Option`], and an
/// array of `U8` becomes [`AlgebraicType::Bytes`].
fn parse_type(node: &Json) -> Result<AlgebraicType, SchemaError> {
    let obj = node
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| SchemaError::BadType(format!("expected a single-key type object, got {node}")))?;
    let (key, value) = obj.iter().next().expect("len checked above");

    Ok(match key.as_str() {
        "Bool" => AlgebraicType::Bool,
        "I8" => AlgebraicType::I8,
        "U8" => AlgebraicType::U8,
        "I16" => AlgebraicType::I16,
        "U16" => AlgebraicType::U16,
        "I32" => AlgebraicType::I32,
        "U32" => AlgebraicType::U32,
        "I64" => AlgebraicType::I64,
        "U64" => AlgebraicType::U64,
        "I128" => AlgebraicType::I128,
        "U128" => AlgebraicType::U128,
        "I256" => AlgebraicType::I256,
        "U256" => AlgebraicType::U256,
        "F32" => AlgebraicType::F32,
        "F64" => AlgebraicType::F64,
        "String" => AlgebraicType::String,
        "Bytes" => AlgebraicType::Bytes,
        "Ref" => {
            let idx = value
                .as_u64()
                .ok_or_else(|| SchemaError::BadType(format!("Ref index must be an integer, got {value}")))?;
            AlgebraicType::Ref(idx as u32)
        }
        "Array" => match parse_type(value)? {
            AlgebraicType::U8 => AlgebraicType::Bytes,
            elem => AlgebraicType::array(elem),
        },
        "Product" => {
            let elements = elements_field(value, "elements")?;
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(ProductTypeElement {
                    name: name_field(element)?,
                    algebraic_type: parse_type(type_field(element)?)?,
                });
            }
            AlgebraicType::product(out)
        }
        "Sum" => {
            let variants = elements_field(value, "variants")?;
            let mut out = Vec::with_capacity(variants.len());
            for variant in variants {
                let payload = match parse_type(type_field(variant)?)? {
                    // A unit product payload is a payloadless variant.
                    AlgebraicType::Product(p) if p.elements.is_empty() => None,
                    ty => Some(ty),
                };
                out.push(SumTypeVariant {
                    name: name_field(variant)?,
                    algebraic_type: payload,
                });
            }
            match option_payload(&out) {
                Some(inner) => AlgebraicType::option(inner),
                None => AlgebraicType::sum(out),
            }
        }
        other => return Err(SchemaError::BadType(format!("unknown type constructor `{other}`"))),
    })
}

/// If `variants` is the canonical option shape (`some` with a payload, then
/// `none` without), the payload type.
fn option_payload(variants: &[SumTypeVariant]) -> Option<AlgebraicType> {
    match variants {
        [some, none]
            if some.name.as_deref() == Some("some")
                && none.name.as_deref() == Some("none")
                && none.algebraic_type.is_none() =>
        {
            some.algebraic_type.clone()
        }
        _ => None,
    }
}

fn elements_field<'a>(value: &'a Json, field: &str) -> Result<&'a Vec<Json>, SchemaError> {
    value
        .get(field)
        .and_then(Json::as_array)
        .ok_or_else(|| SchemaError::BadType(format!("expected `{field}` array, got {value}")))
}

fn type_field(element: &Json) -> Result<&Json, SchemaError> {
    element
        .get("algebraic_type")
        .ok_or_else(|| SchemaError::BadType(format!("element without `algebraic_type`: {element}")))
}

/// Element and variant names serialize as an option: `{"some": "name"}` or
/// `{"none": []}`. Plain strings and nulls are tolerated too.
fn name_field(element: &Json) -> Result<Option<Box<str>>, SchemaError> {
    match element.get("name") {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.as_str().into())),
        Some(Json::Object(o)) => match (o.get("some"), o.contains_key("none")) {
            (Some(Json::String(s)), _) => Ok(Some(s.as_str().into())),
            (None, true) => Ok(None),
            _ => Err(SchemaError::BadType(format!("malformed name option: {element}"))),
        },
        Some(other) => Err(SchemaError::BadType(format!("malformed name: {other}"))),
    }
}

/// Replaces every `Ref` in `ty` by cloning the referenced definition out of
/// the typespace, to a bounded depth.
fn resolve(ty: &AlgebraicType, typespace: &[AlgebraicType], depth: u32) -> Result<AlgebraicType, SchemaError> {
    Ok(match ty {
        AlgebraicType::Ref(idx) => {
            if depth == 0 {
                return Err(SchemaError::UnresolvedRef(*idx));
            }
            let target = typespace
                .get(*idx as usize)
                .ok_or(SchemaError::UnresolvedRef(*idx))?;
            resolve(target, typespace, depth - 1)?
        }
        AlgebraicType::Array(elem) => AlgebraicType::array(resolve(elem, typespace, depth)?),
        AlgebraicType::Option(inner) => AlgebraicType::option(resolve(inner, typespace, depth)?),
        AlgebraicType::Product(p) => {
            let mut elements = Vec::with_capacity(p.elements.len());
            for element in p.elements.iter() {
                elements.push(ProductTypeElement {
                    name: element.name.clone(),
                    algebraic_type: resolve(&element.algebraic_type, typespace, depth)?,
                });
            }
            AlgebraicType::product(elements)
        }
        AlgebraicType::Sum(s) => {
            let mut variants = Vec::with_capacity(s.variants.len());
            for variant in s.variants.iter() {
                variants.push(SumTypeVariant {
                    name: variant.name.clone(),
                    algebraic_type: variant
                        .algebraic_type
                        .as_ref()
                        .map(|t| resolve(t, typespace, depth))
                        .transpose()?,
                });
            }
            AlgebraicType::sum(variants)
        }
        leaf => leaf.clone(),
    })
}

/// Views a resolved product type as a named column list.
fn columns_of(ty: &AlgebraicType, owner: &str) -> Result<Box<[Column]>, SchemaError> {
    let AlgebraicType::Product(p) = ty else {
        return Err(SchemaError::BadType(format!(
            "`{owner}` is not described by a product type"
        )));
    };
    let mut columns = Vec::with_capacity(p.elements.len());
    for (idx, element) in p.elements.iter().enumerate() {
        let name = element
            .name
            .clone()
            .ok_or_else(|| SchemaError::BadType(format!("column {idx} of `{owner}` has no name")))?;
        columns.push(Column {
            name,
            ty: element.algebraic_type.clone(),
        });
    }
    Ok(columns.into())
}
