//! Table schemas: column types, encodings, validation, and the builder used
//! by alter-table steps.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Physical column type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UnixtimeMicros,
    Float,
    Double,
    String,
    Binary,
}

impl ColumnType {
    /// Key columns must support deterministic ordered encoding.
    pub fn allowed_in_key(self) -> bool {
        !matches!(self, ColumnType::Bool | ColumnType::Float | ColumnType::Double)
    }

    fn is_integral(self) -> bool {
        matches!(
            self,
            ColumnType::Int8
                | ColumnType::Int16
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::UnixtimeMicros
        )
    }
}

/// Column block encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingKind {
    Auto,
    Plain,
    Prefix,
    RunLength,
    BitShuffle,
    Dict,
}

impl EncodingKind {
    /// Whether this encoding can store values of `ty`.
    pub fn supports(self, ty: ColumnType) -> bool {
        match self {
            EncodingKind::Auto | EncodingKind::Plain => true,
            EncodingKind::Prefix | EncodingKind::Dict => {
                matches!(ty, ColumnType::String | ColumnType::Binary)
            }
            EncodingKind::RunLength => ty.is_integral() || ty == ColumnType::Bool,
            EncodingKind::BitShuffle => {
                ty.is_integral() || matches!(ty, ColumnType::Float | ColumnType::Double)
            }
        }
    }
}

/// One column of a table schema. Defaults are carried as opaque encoded
/// values; the master never interprets them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub is_nullable: bool,
    pub encoding: EncodingKind,
    pub read_default: Option<Vec<u8>>,
    pub write_default: Option<Vec<u8>>,
    /// Server-assigned column ID. Absent in client-supplied schemas.
    pub id: Option<i32>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_nullable: false,
            encoding: EncodingKind::Auto,
            read_default: None,
            write_default: None,
            id: None,
        }
    }
}

/// Propagate the read default to the write default and reject inconsistent
/// combinations. Clients are expected to send only the read default.
pub fn process_column_defaults(col: &mut ColumnSchema) -> Result<()> {
    match (&col.read_default, &col.write_default) {
        (Some(read), None) => col.write_default = Some(read.clone()),
        (Some(read), Some(write)) if read != write => {
            bail!("column '{}' has mismatched read/write defaults", col.name);
        }
        (None, Some(_)) => {
            bail!(
                "column '{}' has write default set but no read default",
                col.name
            );
        }
        _ => {}
    }
    Ok(())
}

/// An ordered set of columns; the first `num_key_columns` form the primary
/// key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnSchema>,
    pub num_key_columns: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Self {
        Self { columns, num_key_columns }
    }

    pub fn has_column_ids(&self) -> bool {
        self.columns.iter().any(|c| c.id.is_some())
    }

    /// Copy of this schema with column IDs assigned sequentially.
    pub fn with_assigned_ids(&self) -> Schema {
        let mut schema = self.clone();
        for (i, col) in schema.columns.iter_mut().enumerate() {
            col.id = Some(i as i32);
        }
        schema
    }

    pub fn max_column_id(&self) -> i32 {
        self.columns.iter().filter_map(|c| c.id).max().unwrap_or(-1)
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.key_columns().iter().any(|c| c.name == name)
    }
}

/// Validate a table or column name.
pub fn validate_identifier(id: &str, max_length: usize) -> Result<()> {
    if id.is_empty() {
        bail!("empty string not a valid identifier");
    }
    if id.len() > max_length {
        bail!("identifier '{id}' longer than maximum permitted length {max_length}");
    }
    if id.contains('\0') {
        bail!("identifier must not contain null bytes");
    }
    Ok(())
}

/// Validate a client-provided schema (and optionally the table name).
pub fn validate_client_schema(
    name: Option<&str>,
    schema: &Schema,
    max_identifier_length: usize,
    max_num_columns: usize,
) -> Result<()> {
    if let Some(name) = name {
        validate_identifier(name, max_identifier_length)
            .map_err(|e| anyhow!("invalid table name: {e}"))?;
    }
    for col in &schema.columns {
        validate_identifier(&col.name, max_identifier_length)
            .map_err(|e| anyhow!("invalid column name: {e}"))?;
    }
    if schema.num_key_columns == 0 {
        bail!("must specify at least one key column");
    }
    if schema.num_key_columns > schema.columns.len() {
        bail!("number of key columns exceeds number of columns");
    }
    if schema.columns.len() > max_num_columns {
        bail!(
            "number of columns {} is greater than the permitted maximum {}",
            schema.columns.len(),
            max_num_columns
        );
    }
    {
        let mut names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            bail!("duplicate column name");
        }
    }
    for col in schema.key_columns() {
        if !col.column_type.allowed_in_key() {
            bail!("key column may not have type of BOOL, FLOAT, or DOUBLE");
        }
        if col.is_nullable {
            bail!("key column '{}' may not be nullable", col.name);
        }
    }
    for col in &schema.columns {
        if !col.encoding.supports(col.column_type) {
            bail!(
                "invalid encoding {:?} for column '{}' of type {:?}",
                col.encoding,
                col.name,
                col.column_type
            );
        }
    }
    Ok(())
}

/// A requested change to a single existing column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDelta {
    pub name: String,
    pub new_name: Option<String>,
    pub new_default: Option<Vec<u8>>,
    pub remove_default: bool,
    pub encoding: Option<EncodingKind>,
}

/// Incrementally edits a schema while keeping column IDs stable across
/// alters. Freshly added columns receive IDs from `next_column_id`.
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    next_column_id: i32,
}

impl SchemaBuilder {
    pub fn from_schema(schema: &Schema, next_column_id: i32) -> Self {
        Self {
            columns: schema.columns.clone(),
            num_key_columns: schema.num_key_columns,
            next_column_id,
        }
    }

    pub fn next_column_id(&self) -> i32 {
        self.next_column_id
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.columns[..self.num_key_columns].iter().any(|c| c.name == name)
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn add_column(&mut self, mut col: ColumnSchema) -> Result<()> {
        if self.find(&col.name).is_some() {
            bail!("column '{}' already exists", col.name);
        }
        col.id = Some(self.next_column_id);
        self.next_column_id += 1;
        self.columns.push(col);
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        if self.is_key_column(name) {
            bail!("cannot remove a key column: {name}");
        }
        let idx = self
            .find(name)
            .ok_or_else(|| anyhow!("column '{name}' not found"))?;
        self.columns.remove(idx);
        Ok(())
    }

    pub fn rename_column(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if self.find(new_name).is_some() {
            bail!("column '{new_name}' already exists");
        }
        let idx = self
            .find(old_name)
            .ok_or_else(|| anyhow!("column '{old_name}' not found"))?;
        self.columns[idx].name = new_name.to_string();
        Ok(())
    }

    pub fn apply_delta(&mut self, delta: &ColumnDelta) -> Result<()> {
        if delta.new_default.is_some() && delta.remove_default {
            bail!(
                "column '{}': cannot set a default and remove the default in one step",
                delta.name
            );
        }
        if let Some(new_name) = &delta.new_name {
            self.rename_column(&delta.name, new_name)?;
        }
        let name = delta.new_name.as_deref().unwrap_or(&delta.name);
        let is_key = self.is_key_column(name);
        let idx = self
            .find(name)
            .ok_or_else(|| anyhow!("column '{}' not found", delta.name))?;
        let col = &mut self.columns[idx];
        if delta.new_default.is_some() || delta.remove_default {
            if is_key {
                bail!("cannot alter the default of key column '{}'", col.name);
            }
            col.write_default = delta.new_default.clone();
            if delta.remove_default {
                col.write_default = None;
            }
        }
        if let Some(encoding) = delta.encoding {
            if !encoding.supports(col.column_type) {
                bail!(
                    "invalid encoding {:?} for column '{}' of type {:?}",
                    encoding,
                    col.name,
                    col.column_type
                );
            }
            col.encoding = encoding;
        }
        Ok(())
    }

    pub fn build(self) -> (Schema, i32) {
        (
            Schema {
                columns: self.columns,
                num_key_columns: self.num_key_columns,
            },
            self.next_column_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_col(name: &str) -> ColumnSchema {
        ColumnSchema::new(name, ColumnType::Int64)
    }

    fn two_column_schema() -> Schema {
        Schema::new(
            vec![key_col("key"), ColumnSchema::new("val", ColumnType::String)],
            1,
        )
    }

    #[test]
    fn client_schema_validation() {
        let schema = two_column_schema();
        validate_client_schema(Some("t"), &schema, 256, 300).expect("valid schema");

        let no_keys = Schema::new(vec![ColumnSchema::new("a", ColumnType::Int32)], 0);
        assert!(validate_client_schema(None, &no_keys, 256, 300).is_err());

        let bool_key = Schema::new(vec![ColumnSchema::new("k", ColumnType::Bool)], 1);
        assert!(validate_client_schema(None, &bool_key, 256, 300).is_err());

        let mut bad_encoding = two_column_schema();
        bad_encoding.columns[0].encoding = EncodingKind::Prefix;
        assert!(validate_client_schema(None, &bad_encoding, 256, 300).is_err());

        assert!(validate_client_schema(Some(""), &schema, 256, 300).is_err());
        assert!(validate_client_schema(Some("x".repeat(10).as_str()), &schema, 4, 300).is_err());
    }

    #[test]
    fn duplicate_column_names_rejected() {
        let schema = Schema::new(vec![key_col("k"), key_col("k")], 1);
        assert!(validate_client_schema(None, &schema, 256, 300).is_err());
    }

    #[test]
    fn defaults_propagate_read_to_write() {
        let mut col = ColumnSchema::new("c", ColumnType::Int32);
        col.read_default = Some(vec![1]);
        process_column_defaults(&mut col).expect("propagate");
        assert_eq!(col.write_default, Some(vec![1]));

        let mut mismatched = ColumnSchema::new("c", ColumnType::Int32);
        mismatched.read_default = Some(vec![1]);
        mismatched.write_default = Some(vec![2]);
        assert!(process_column_defaults(&mut mismatched).is_err());

        let mut write_only = ColumnSchema::new("c", ColumnType::Int32);
        write_only.write_default = Some(vec![2]);
        assert!(process_column_defaults(&mut write_only).is_err());
    }

    #[test]
    fn builder_assigns_ids_and_protects_keys() {
        let schema = two_column_schema().with_assigned_ids();
        let mut builder = SchemaBuilder::from_schema(&schema, schema.max_column_id() + 1);

        let mut extra = ColumnSchema::new("extra", ColumnType::Int32);
        extra.is_nullable = true;
        builder.add_column(extra).expect("add column");
        assert!(builder.remove_column("key").is_err(), "key columns are not droppable");
        builder.remove_column("val").expect("drop column");
        builder.rename_column("extra", "extra2").expect("rename");

        let (built, next_id) = builder.build();
        assert_eq!(next_id, 3);
        assert_eq!(built.columns.len(), 2);
        assert_eq!(built.columns[1].name, "extra2");
        assert_eq!(built.columns[1].id, Some(2));
    }

    #[test]
    fn delta_edits_default_and_encoding() {
        let schema = two_column_schema().with_assigned_ids();
        let mut builder = SchemaBuilder::from_schema(&schema, schema.max_column_id() + 1);
        builder
            .apply_delta(&ColumnDelta {
                name: "val".to_string(),
                new_default: Some(vec![9]),
                encoding: Some(EncodingKind::Dict),
                ..Default::default()
            })
            .expect("apply delta");
        let (built, _) = builder.build();
        assert_eq!(built.columns[1].write_default, Some(vec![9]));
        assert_eq!(built.columns[1].encoding, EncodingKind::Dict);

        let mut builder = SchemaBuilder::from_schema(&schema, schema.max_column_id() + 1);
        assert!(builder
            .apply_delta(&ColumnDelta {
                name: "key".to_string(),
                new_default: Some(vec![1]),
                ..Default::default()
            })
            .is_err());
    }
}
