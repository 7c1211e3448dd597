//! Query builder facade: schema, configuration and cache in one place.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::ast::{EntityInstance, OperatorChain};
use crate::cache::{CacheKey, CacheStats, MutationKey, MutationKind, QueryCache};
use crate::compiler::{self, RowMaterializer};
use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::query::{
    CompiledQuery, DeleteQuery, DirectQuery, ParameterizedQuery, SelectQuery, UpsertQuery,
};
use crate::schema::SchemaResolver;

fn unexpected(kind: &str) -> CompileError {
    CompileError::unsupported(format!("cache entry is not a {} query", kind))
}

pub struct QueryBuilder {
    schema: Arc<dyn SchemaResolver>,
    config: CompilerConfig,
    cache: QueryCache,
}

impl QueryBuilder {
    pub fn new(schema: Arc<dyn SchemaResolver>, config: CompilerConfig) -> Self {
        Self {
            schema,
            config,
            cache: QueryCache::new(),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn schema(&self) -> &dyn SchemaResolver {
        self.schema.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.len()
    }

    /// Swap in a new schema snapshot and drop every compiled query.
    pub fn invalidate(&mut self, schema: Arc<dyn SchemaResolver>) {
        debug!(dropped = self.cache.len(), "schema changed, clearing query cache");
        self.schema = schema;
        self.cache.clear();
    }

    fn cached(
        &self,
        key: CacheKey,
        label: &str,
        compile: impl FnOnce() -> Result<CompiledQuery>,
    ) -> Result<CompiledQuery> {
        if let Some(found) = self.cache.get(&key) {
            debug!(query = label, "cache hit");
            return Ok(found);
        }
        debug!(query = label, "cache miss");
        let start = Instant::now();
        let compiled = compile().inspect_err(|e| warn!(query = label, error = %e, "compile failed"))?;
        debug!(query = label, elapsed = ?start.elapsed(), "compiled");
        Ok(self.cache.insert_if_absent(key, compiled))
    }

    pub fn get_select_query(&self, chain: &OperatorChain) -> Result<Arc<SelectQuery>> {
        let label = chain.root_entity().unwrap_or("select").to_string();
        let compiled = self.cached(CacheKey::Select(chain.clone()), &label, || {
            compiler::compile_select(self.schema(), &self.config, chain)
                .map(|q| CompiledQuery::Select(Arc::new(q)))
        })?;
        compiled.as_select().cloned().ok_or_else(|| unexpected("select"))
    }

    pub fn get_insert_query(&self, instance: &EntityInstance) -> Result<Arc<UpsertQuery>> {
        let key = self.mutation_key(MutationKind::Insert, instance, BTreeSet::new());
        let compiled = self.cached(key, "insert", || {
            compiler::compile_insert(self.schema(), &self.config.dialect, &instance.type_name)
                .map(|q| CompiledQuery::Upsert(Arc::new(q)))
        })?;
        compiled.as_upsert().cloned().ok_or_else(|| unexpected("upsert"))
    }

    /// Update template for the members named in `modified`.
    pub fn get_update_query(
        &self,
        instance: &EntityInstance,
        modified: &[&str],
    ) -> Result<Arc<UpsertQuery>> {
        let members: BTreeSet<String> = modified.iter().map(|m| m.to_string()).collect();
        let key = self.mutation_key(MutationKind::Update, instance, members.clone());
        let compiled = self.cached(key, "update", || {
            compiler::compile_update(
                self.schema(),
                &self.config.dialect,
                &instance.type_name,
                &members,
            )
            .map(|q| CompiledQuery::Upsert(Arc::new(q)))
        })?;
        compiled.as_upsert().cloned().ok_or_else(|| unexpected("upsert"))
    }

    pub fn get_delete_query(&self, instance: &EntityInstance) -> Result<Arc<DeleteQuery>> {
        let key = self.mutation_key(MutationKind::Delete, instance, BTreeSet::new());
        let compiled = self.cached(key, "delete", || {
            compiler::compile_delete(self.schema(), &self.config.dialect, &instance.type_name)
                .map(|q| CompiledQuery::Delete(Arc::new(q)))
        })?;
        compiled.as_delete().cloned().ok_or_else(|| unexpected("delete"))
    }

    pub fn get_direct_query(&self, sql: &str) -> Result<Arc<DirectQuery>> {
        let compiled = self.cached(CacheKey::Direct(sql.to_string()), "direct", || {
            compiler::compile_direct(sql, &self.config.dialect)
                .map(|q| CompiledQuery::Direct(Arc::new(q)))
        })?;
        compiled.as_direct().cloned().ok_or_else(|| unexpected("direct"))
    }

    /// Raw SQL bound to `target`. Never cached: the target is part of the result.
    pub fn get_parameterized_query(
        &self,
        sql: &str,
        target: &EntityInstance,
    ) -> Result<ParameterizedQuery> {
        compiler::compile_parameterized(sql, target, &self.config.dialect)
    }

    pub fn get_table_reader(&self, entity: &str, aliases: &[&str]) -> Result<RowMaterializer> {
        compiler::build_materializer(self.schema(), entity, aliases)
    }

    fn mutation_key(
        &self,
        kind: MutationKind,
        instance: &EntityInstance,
        members: BTreeSet<String>,
    ) -> CacheKey {
        CacheKey::Mutation(MutationKey {
            kind,
            entity: instance.type_name.clone(),
            members,
        })
    }
}
