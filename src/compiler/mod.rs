/// Chain compilation pipeline.
///
/// ```text
/// OperatorChain
///       ↓
/// Analyzer      (analyzer.rs, arguments.rs)   scope tree + parameters
///       ↓
/// Projections   (projection.rs)               SELECT lists + row shapes
///       ↓
/// Emitter       (emitter.rs)                  SelectStatement
///       ↓
/// Renderer      (sql::render)                 SQL text
/// ```
///
/// Mutations (mutation.rs) and raw SQL (direct.rs) skip the analyzer and
/// build statements straight from the schema or the token stream.
pub mod analyzer;
pub mod arguments;
pub mod direct;
pub mod emitter;
pub mod materializer;
pub mod mutation;
pub mod projection;
pub mod scope;

pub use analyzer::Analyzer;
pub use direct::{compile_direct, compile_parameterized};
pub use emitter::Emitter;
pub use materializer::{build_materializer, MappingContext, RowMaterializer, Shape};
pub use mutation::{compile_delete, compile_insert, compile_update};
pub use scope::{CompilationContext, ScopeKind, ScopeTransition, ScopeView, SelectScope};

use tracing::trace;

use crate::ast::OperatorChain;
use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::query::{InputParameterDescriptor, SelectQuery};
use crate::schema::SchemaResolver;
use crate::sql::{render, Statement};

/// Analyze, project, emit and render one chain.
pub fn compile_select(
    schema: &dyn SchemaResolver,
    config: &CompilerConfig,
    chain: &OperatorChain,
) -> Result<SelectQuery> {
    let mut analyzer = Analyzer::new(schema, config, chain);
    let seq = analyzer.analyze_root()?;
    let last = seq.view.scope;
    if analyzer.ctx.scope(last).projection.is_none() {
        analyzer.ctx.scope_mut(last).projection = Some(seq.element);
    }

    // Set operands and sub-queries get their SELECT lists here; join scopes
    // are inlined into their parent and never project.
    let mut index = 0;
    while index < analyzer.ctx.scopes().len() {
        let scope = &analyzer.ctx.scopes()[index];
        let id = scope.id;
        if scope.kind != ScopeKind::Join && scope.projection.is_some() && scope.output.is_none() {
            let output = analyzer.build_projection(id)?;
            analyzer.ctx.scope_mut(id).output = Some(output);
        }
        index += 1;
    }

    let ctx = analyzer.into_context();
    let final_scope = ctx.scope(last);
    let shape = final_scope
        .output
        .as_ref()
        .map(|o| o.shape.clone())
        .ok_or_else(|| CompileError::unsupported("chain without a projection"))?;
    let scalar_method_name = final_scope.scalar_method.map(|op| op.name().to_string());

    let emitter = Emitter::new(&ctx, schema, &config.dialect);
    let statement = Statement::Select(Box::new(emitter.select_statement(last)?));
    let sql = render(&statement, &config.dialect);
    trace!(scopes = ctx.scopes().len(), tables = ctx.tables().len(), %sql, "emitted select");

    let input_parameters = ctx
        .parameters()
        .iter()
        .map(|p| InputParameterDescriptor {
            name: p.name.clone(),
            extractor: p.extractor.clone(),
            declared_type: p.declared_type.clone(),
        })
        .collect();

    Ok(SelectQuery {
        sql,
        input_parameters,
        materializer: RowMaterializer::new(shape),
        scalar_method_name,
    })
}
