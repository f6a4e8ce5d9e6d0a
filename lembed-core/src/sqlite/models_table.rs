//! `lembed_models` virtual table
//!
//! Reading lists the registry; inserting a row loads and registers a model:
//!
//! ```sql
//! INSERT INTO lembed_models(name, model, context_options)
//!   VALUES ('default', lembed_model_from_file('all-MiniLM-L6-v2.q8_0.gguf'),
//!           lembed_context_options('seed', 42));
//! ```

use super::handles::ResourceRef;
use super::Shared;
use crate::registry::{self, ModelHandle};
use crate::LembedError;
use rusqlite::ffi;
use rusqlite::types::ValueRef;
use rusqlite::vtab::{
    Context, CreateVTab, IndexInfo, UpdateVTab, VTab, VTabConnection, VTabCursor, VTabKind,
    Values,
};
use rusqlite::{Error, Result};
use std::marker::PhantomData;
use std::os::raw::c_int;
use tracing::debug;

const COLUMN_NAME: c_int = 0;
const COLUMN_MODEL: c_int = 1;

/// Position of the first column value in xUpdate arguments (after old and new rowid)
const FIRST_COLUMN_ARG: usize = 2;
const ARG_NAME: usize = FIRST_COLUMN_ARG;
const ARG_MODEL: usize = FIRST_COLUMN_ARG + 1;
const ARG_MODEL_OPTIONS: usize = FIRST_COLUMN_ARG + 2;
const ARG_CONTEXT_OPTIONS: usize = FIRST_COLUMN_ARG + 3;

#[repr(C)]
pub(crate) struct ModelsTable {
    base: ffi::sqlite3_vtab,
    shared: Shared,
}

unsafe impl<'vtab> VTab<'vtab> for ModelsTable {
    type Aux = Shared;
    type Cursor = ModelsCursor<'vtab>;

    fn connect(
        _: &mut VTabConnection,
        aux: Option<&Shared>,
        _args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let shared = aux
            .cloned()
            .ok_or_else(|| Error::ModuleError("lembed_models has no registry".to_string()))?;
        let table = ModelsTable {
            base: ffi::sqlite3_vtab::default(),
            shared,
        };
        Ok((
            "CREATE TABLE x(name, model, model_options hidden, context_options hidden)".to_owned(),
            table,
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        // Always a full scan of at most MAX_MODELS rows
        info.set_idx_num(1);
        info.set_estimated_cost(10.0);
        Ok(())
    }

    fn open(&'vtab mut self) -> Result<ModelsCursor<'vtab>> {
        Ok(ModelsCursor::new(self.shared.clone()))
    }
}

impl CreateVTab<'_> for ModelsTable {
    const KIND: VTabKind = VTabKind::EponymousOnly;
}

impl UpdateVTab<'_> for ModelsTable {
    fn delete(&mut self, _: ValueRef<'_>) -> Result<()> {
        Err(LembedError::InvalidOperation(
            "models cannot be deleted from lembed_models".to_string(),
        )
        .into())
    }

    fn insert(&mut self, args: &Values<'_>) -> Result<i64> {
        let name = match args.get::<Option<String>>(ARG_NAME) {
            Ok(Some(name)) => name,
            _ => {
                return Err(LembedError::InvalidArgument(
                    "lembed_models.name must be a text value".to_string(),
                )
                .into())
            }
        };
        let path = ResourceRef::model_path(super::arg(args, ARG_MODEL)?)?;
        let model_options = ResourceRef::model_options(super::arg(args, ARG_MODEL_OPTIONS)?)?;
        let context_options =
            ResourceRef::context_options(super::arg(args, ARG_CONTEXT_OPTIONS)?)?;

        let path = self.shared.config.resolve_model_path(path);
        let mut registry = registry::lock(&self.shared.registry)?;
        let handle = registry.insert(&name, &path, &model_options, &context_options)?;

        Ok(handle.slot as i64)
    }

    fn update(&mut self, _: &Values<'_>) -> Result<()> {
        Err(LembedError::InvalidOperation(
            "models registered in lembed_models cannot be updated".to_string(),
        )
        .into())
    }
}

/// Rows are captured when the scan starts
#[repr(C)]
pub(crate) struct ModelsCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    shared: Shared,
    rows: Vec<(ModelHandle, String)>,
    row: usize,
    phantom: PhantomData<&'vtab ModelsTable>,
}

impl ModelsCursor<'_> {
    fn new(shared: Shared) -> Self {
        Self {
            base: ffi::sqlite3_vtab_cursor::default(),
            shared,
            rows: Vec::new(),
            row: 0,
            phantom: PhantomData,
        }
    }
}

unsafe impl VTabCursor for ModelsCursor<'_> {
    fn filter(
        &mut self,
        _idx_num: c_int,
        _idx_str: Option<&str>,
        _args: &Values<'_>,
    ) -> Result<()> {
        let registry = registry::lock(&self.shared.registry)?;
        self.rows = registry
            .enumerate()
            .map(|(handle, entry)| (handle, entry.name().to_string()))
            .collect();
        self.row = 0;
        debug!(models = self.rows.len(), "Scanning lembed_models");
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.row += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.row >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let Some((handle, name)) = self.rows.get(self.row) else {
            return ctx.set_result(&rusqlite::types::Null);
        };
        match i {
            COLUMN_NAME => ctx.set_result(name),
            COLUMN_MODEL => ctx.set_result(&ResourceRef::Model { handle: *handle }),
            // Hidden input-only columns
            _ => ctx.set_result(&rusqlite::types::Null),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self
            .rows
            .get(self.row)
            .map_or(-1, |(handle, _)| handle.slot as i64))
    }
}
