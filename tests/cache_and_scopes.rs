mod common;

use std::sync::Arc;
use std::thread;

use chainql::compiler::{Analyzer, ScopeKind};
use chainql::{CompilerConfig, ExpressionNode, OperatorChain, QueryBuilder};
use common::{eq, init_tracing, lambda, path, schema};

fn customers_named(name: &str, limit: i64) -> OperatorChain {
    OperatorChain::from_table("Customer")
        .filter(lambda("c", eq(path("c", &["Name"]), ExpressionNode::constant(name))))
        .take(limit)
}

#[test]
fn test_concurrent_compiles_retain_one_entry() {
    init_tracing();
    let builder = QueryBuilder::new(Arc::new(schema()), CompilerConfig::default());
    let threads = 8;

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let builder = &builder;
                s.spawn(move || {
                    // Every thread builds its own chain with its own values.
                    let chain = customers_named(&format!("customer-{}", i), i as i64 + 1);
                    builder.get_select_query(&chain)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("compile thread panicked"))
            .collect()
    });

    let queries: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(builder.cached_queries(), 1);
    let retained = builder
        .get_select_query(&customers_named("anyone", 1))
        .unwrap();
    for query in &queries {
        assert_eq!(query.sql, retained.sql);
        assert_eq!(query.input_parameters, retained.input_parameters);
    }
    // Callers that arrive after the insert share the retained artifact.
    assert!(Arc::ptr_eq(
        &retained,
        &builder.get_select_query(&customers_named("later", 9)).unwrap()
    ));
}

#[test]
fn test_promotion_reparents_the_sibling_chain() {
    let chain = OperatorChain::from_table("Customer")
        .union(OperatorChain::from_table("Customer").filter(lambda(
            "c",
            eq(path("c", &["Name"]), ExpressionNode::constant("Acme")),
        )))
        .concat(OperatorChain::from_table("Customer"))
        .take(3);

    let schema = schema();
    let config = CompilerConfig::default();
    let mut analyzer = Analyzer::new(&schema, &config, &chain);
    let seq = analyzer.analyze_root().unwrap();
    let ctx = analyzer.context();

    let wrapper = ctx.scope(seq.view.scope);
    assert_eq!(wrapper.kind, ScopeKind::Wrapper);
    assert!(ctx.scopes().iter().all(|s| s.id.0 <= wrapper.id.0));

    // Left operand plus both set operands.
    let mut chained = Vec::new();
    let mut cursor = Some(ctx.scopes()[0].id);
    while let Some(id) = cursor {
        chained.push(id);
        cursor = ctx.scope(id).next.map(|link| link.scope);
    }
    assert_eq!(chained.len(), 3);
    for id in chained {
        assert_eq!(ctx.scope(id).parent, Some(wrapper.id));
    }
}

#[test]
fn test_paged_union_wraps_as_derived_table() {
    let chain = OperatorChain::from_table("Customer")
        .union(OperatorChain::from_table("Customer").filter(lambda(
            "c",
            eq(path("c", &["Name"]), ExpressionNode::constant("Acme")),
        )))
        .take(3);
    let query = common::builder().get_select_query(&chain).unwrap();
    assert!(
        query.sql.contains(
            "FROM (SELECT t0.Id, t0.Name FROM Customers t0 UNION \
             SELECT t1.Id, t1.Name FROM Customers t1 WHERE t1.Name = @p0) t2"
        ),
        "{}",
        query.sql
    );
    assert!(query.sql.ends_with("LIMIT @p1"), "{}", query.sql);
    assert_eq!(query.input_parameters.len(), 2);
}

#[test]
fn test_invalidate_forces_recompile() {
    let mut builder = common::builder();
    let chain = customers_named("Acme", 1);
    let before = builder.get_select_query(&chain).unwrap();
    builder.invalidate(Arc::new(schema()));
    let after = builder.get_select_query(&chain).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.sql, after.sql);
    assert_eq!(builder.cache_stats().misses, 2);
}
