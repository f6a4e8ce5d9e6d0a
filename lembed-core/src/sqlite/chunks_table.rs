//! `lembed_chunks` table-valued function
//!
//! ```sql
//! SELECT contents, token_count FROM lembed_chunks('default', :document, 128);
//! ```

use super::Shared;
use crate::embeddings::Chunk;
use crate::registry;
use crate::LembedError;
use rusqlite::ffi;
use rusqlite::vtab::{
    Context, IndexConstraintOp, IndexInfo, VTab, VTabConnection, VTabCursor, Values,
};
use rusqlite::{Error, Result};
use std::marker::PhantomData;
use std::os::raw::c_int;

const COLUMN_CONTENTS: c_int = 0;
const COLUMN_TOKEN_COUNT: c_int = 1;
const COLUMN_MODEL: c_int = 2;
const COLUMN_SOURCE: c_int = 3;
const COLUMN_CHUNK_SIZE: c_int = 4;

/// `idx_num` bit set when a chunk size argument is passed to `filter`
const HAS_CHUNK_SIZE: c_int = 1;

#[repr(C)]
pub(crate) struct ChunksTable {
    base: ffi::sqlite3_vtab,
    shared: Shared,
}

unsafe impl<'vtab> VTab<'vtab> for ChunksTable {
    type Aux = Shared;
    type Cursor = ChunksCursor<'vtab>;

    fn connect(
        _: &mut VTabConnection,
        aux: Option<&Shared>,
        _args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let shared = aux
            .cloned()
            .ok_or_else(|| Error::ModuleError("lembed_chunks has no registry".to_string()))?;
        let table = ChunksTable {
            base: ffi::sqlite3_vtab::default(),
            shared,
        };
        Ok((
            "CREATE TABLE x(contents, token_count, model hidden, source hidden, chunk_size hidden)"
                .to_owned(),
            table,
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        // Constraint index bound to each argument: model, source, chunk_size
        let mut bound: [Option<usize>; 3] = [None; 3];
        let mut unusable = false;

        for (i, constraint) in info.constraints().enumerate() {
            let slot = match constraint.column() {
                COLUMN_MODEL => 0,
                COLUMN_SOURCE => 1,
                COLUMN_CHUNK_SIZE => 2,
                _ => continue,
            };
            if !matches!(
                constraint.operator(),
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
            ) {
                continue;
            }
            if !constraint.is_usable() {
                unusable = true;
                continue;
            }
            bound[slot].get_or_insert(i);
        }

        let (Some(model), Some(source)) = (bound[0], bound[1]) else {
            if unusable {
                // Ask the planner for an order that makes the arguments available
                return Err(Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                    None,
                ));
            }
            return Err(Error::ModuleError(
                "model and source arguments are required".to_string(),
            ));
        };

        let mut idx_num = 0;
        let mut args = vec![model, source];
        if let Some(chunk_size) = bound[2] {
            args.push(chunk_size);
            idx_num |= HAS_CHUNK_SIZE;
        }
        for (n, constraint) in args.into_iter().enumerate() {
            let mut usage = info.constraint_usage(constraint);
            usage.set_argv_index(n as c_int + 1);
            usage.set_omit(true);
        }

        info.set_idx_num(idx_num);
        info.set_estimated_cost(10.0);
        Ok(())
    }

    fn open(&'vtab mut self) -> Result<ChunksCursor<'vtab>> {
        Ok(ChunksCursor::new(self.shared.clone()))
    }
}

/// Chunks are computed eagerly when the scan starts
#[repr(C)]
pub(crate) struct ChunksCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    shared: Shared,
    model: String,
    source: String,
    chunk_size: usize,
    chunks: Vec<Chunk>,
    row: usize,
    phantom: PhantomData<&'vtab ChunksTable>,
}

impl ChunksCursor<'_> {
    fn new(shared: Shared) -> Self {
        Self {
            base: ffi::sqlite3_vtab_cursor::default(),
            shared,
            model: String::new(),
            source: String::new(),
            chunk_size: 0,
            chunks: Vec::new(),
            row: 0,
            phantom: PhantomData,
        }
    }
}

unsafe impl VTabCursor for ChunksCursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        _idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> Result<()> {
        let model = args.get::<Option<String>>(0)?.ok_or_else(|| {
            LembedError::InvalidArgument("lembed_chunks model must not be NULL".to_string())
        })?;
        let source = args.get::<Option<String>>(1)?.ok_or_else(|| {
            LembedError::InvalidArgument("lembed_chunks source must not be NULL".to_string())
        })?;
        let chunk_size = if idx_num & HAS_CHUNK_SIZE != 0 {
            let size = args.get::<i64>(2)?;
            usize::try_from(size)
                .ok()
                .filter(|&size| size >= 1)
                .ok_or_else(|| {
                    LembedError::InvalidArgument(format!(
                        "chunk_size must be at least 1, got {}",
                        size
                    ))
                })?
        } else {
            self.shared.config.default_chunk_size
        };

        let registry = registry::lock(&self.shared.registry)?;
        self.chunks = registry.lookup(&model)?.chunk(&source, chunk_size)?;
        self.model = model;
        self.source = source;
        self.chunk_size = chunk_size;
        self.row = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.row += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.row >= self.chunks.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        let Some(chunk) = self.chunks.get(self.row) else {
            return ctx.set_result(&rusqlite::types::Null);
        };
        match i {
            COLUMN_CONTENTS => ctx.set_result(&chunk.text),
            COLUMN_TOKEN_COUNT => ctx.set_result(&(chunk.token_count as i64)),
            COLUMN_MODEL => ctx.set_result(&self.model),
            COLUMN_SOURCE => ctx.set_result(&self.source),
            COLUMN_CHUNK_SIZE => ctx.set_result(&(self.chunk_size as i64)),
            _ => ctx.set_result(&rusqlite::types::Null),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.row as i64)
    }
}
