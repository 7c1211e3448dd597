/// Statement AST → SQL text.
///
/// Rendering is dialect-aware only where dialects disagree: parameter
/// spelling and the paging clause. Everything else is plain ANSI.
use super::types::*;
use crate::config::{Dialect, LimitStyle};

/// Render a statement for the given dialect.
pub fn render(statement: &Statement, dialect: &Dialect) -> String {
    let renderer = Renderer { dialect };
    match statement {
        Statement::Select(s) => renderer.render_select(s),
        Statement::Insert(i) => renderer.render_insert(i),
        Statement::Update(u) => renderer.render_update(u),
        Statement::Delete(d) => renderer.render_delete(d),
    }
}

struct Renderer<'a> {
    dialect: &'a Dialect,
}

impl Renderer<'_> {
    fn render_select(&self, select: &SelectStatement) -> String {
        let mut parts = Vec::new();

        // SELECT [DISTINCT]
        let mut select_clause = String::from("SELECT ");
        if select.distinct {
            select_clause.push_str("DISTINCT ");
        }
        if select.projections.is_empty() {
            select_clause.push('*');
        } else {
            let items: Vec<String> = select
                .projections
                .iter()
                .map(|item| self.render_select_item(item))
                .collect();
            select_clause.push_str(&items.join(", "));
        }
        parts.push(select_clause);

        // FROM
        if !select.from.is_empty() {
            let tables: Vec<String> = select
                .from
                .iter()
                .map(|table| self.render_table_ref(table))
                .collect();
            parts.push(format!("FROM {}", tables.join(", ")));
        }

        // JOINs
        for join in &select.joins {
            parts.push(self.render_join(join));
        }

        // WHERE
        if let Some(ref filter) = select.filter {
            parts.push(format!("WHERE {}", self.render_expr(filter)));
        }

        // GROUP BY
        if !select.group_by.is_empty() {
            let groups: Vec<String> = select
                .group_by
                .iter()
                .map(|expr| self.render_expr(expr))
                .collect();
            parts.push(format!("GROUP BY {}", groups.join(", ")));
        }

        // HAVING
        if let Some(ref having) = select.having {
            parts.push(format!("HAVING {}", self.render_expr(having)));
        }

        // ORDER BY
        if !select.order_by.is_empty() {
            let orders: Vec<String> = select
                .order_by
                .iter()
                .map(|order| self.render_order_by(order))
                .collect();
            parts.push(format!("ORDER BY {}", orders.join(", ")));
        }

        if let Some(paging) = self.render_paging(select) {
            parts.push(paging);
        }

        // Set operations chain after the left operand's own clauses.
        if let Some(ref set_op) = select.set_op {
            let op_str = match set_op.op {
                SetOperator::Union => "UNION",
                SetOperator::Intersect => "INTERSECT",
                SetOperator::Except => "EXCEPT",
            };
            let all_str = if set_op.all { " ALL" } else { "" };
            parts.push(format!(
                "{}{} {}",
                op_str,
                all_str,
                self.render_select(&set_op.right)
            ));
        }

        parts.join(" ")
    }

    fn render_paging(&self, select: &SelectStatement) -> Option<String> {
        if select.limit.is_none() && select.offset.is_none() {
            return None;
        }
        let limit = select.limit.as_ref().map(|l| self.render_operand(l));
        let offset = select.offset.as_ref().map(|o| self.render_operand(o));
        let clause = match self.dialect.limit_style {
            LimitStyle::LimitOffset => match (limit, offset) {
                (Some(l), Some(o)) => format!("LIMIT {} OFFSET {}", l, o),
                (Some(l), None) => format!("LIMIT {}", l),
                (None, Some(o)) => format!("OFFSET {}", o),
                (None, None) => return None,
            },
            LimitStyle::OffsetFetch => {
                let offset = offset.unwrap_or_else(|| "0".to_string());
                match limit {
                    Some(l) => format!("OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, l),
                    None => format!("OFFSET {} ROWS", offset),
                }
            }
        };
        Some(clause)
    }

    fn render_select_item(&self, item: &SelectItem) -> String {
        let expr_str = self.render_expr(&item.expr);
        match &item.alias {
            Some(a) => format!("{} AS {}", expr_str, a),
            None => expr_str,
        }
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        match table {
            TableRef::Table { name, alias } => match alias {
                Some(a) => format!("{} {}", name, a),
                None => name.clone(),
            },
            TableRef::Subquery { query, alias } => {
                format!("({}) {}", self.render_select(query), alias)
            }
        }
    }

    fn render_join(&self, join: &Join) -> String {
        let type_str = match join.join_type {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT OUTER JOIN",
            JoinType::Cross => "CROSS JOIN",
        };
        let table_str = self.render_table_ref(&join.table);
        match &join.condition {
            Some(expr) => format!("{} {} ON {}", type_str, table_str, self.render_expr(expr)),
            None => format!("{} {}", type_str, table_str),
        }
    }

    /// Paging operands that are not atoms get parenthesized.
    fn render_operand(&self, expr: &Expression) -> String {
        match expr {
            Expression::Literal(_) | Expression::Parameter { .. } | Expression::Nested(_) => {
                self.render_expr(expr)
            }
            other => format!("({})", self.render_expr(other)),
        }
    }

    fn render_expr(&self, expr: &Expression) -> String {
        match expr {
            Expression::Column { table, name } => match table {
                Some(t) => format!("{}.{}", t, name),
                None => name.clone(),
            },
            Expression::Literal(lit) => render_literal(lit),
            Expression::Parameter { name, ordinal } => self.dialect.parameter(name, *ordinal),
            Expression::BinaryOp { left, op, right } => {
                let op_str = match op {
                    BinaryOperator::Eq => "=",
                    BinaryOperator::NotEq => "<>",
                    BinaryOperator::Lt => "<",
                    BinaryOperator::LtEq => "<=",
                    BinaryOperator::Gt => ">",
                    BinaryOperator::GtEq => ">=",
                    BinaryOperator::And => "AND",
                    BinaryOperator::Or => "OR",
                    BinaryOperator::Plus => "+",
                    BinaryOperator::Minus => "-",
                    BinaryOperator::Multiply => "*",
                    BinaryOperator::Divide => "/",
                    BinaryOperator::Modulo => "%",
                    BinaryOperator::Like => "LIKE",
                    BinaryOperator::Concat => "||",
                };
                format!(
                    "{} {} {}",
                    self.render_expr(left),
                    op_str,
                    self.render_expr(right)
                )
            }
            Expression::UnaryOp { op, expr } => match op {
                UnaryOperator::Not => format!("NOT {}", self.render_expr(expr)),
                UnaryOperator::Minus => format!("-{}", self.render_expr(expr)),
            },
            Expression::Function { name, args } => {
                let args_str: Vec<String> = args.iter().map(|a| self.render_expr(a)).collect();
                format!("{}({})", name, args_str.join(", "))
            }
            Expression::Cast { expr, data_type } => {
                format!("CAST({} AS {})", self.render_expr(expr), data_type)
            }
            Expression::Extract { field, expr } => {
                format!("EXTRACT({} FROM {})", field, self.render_expr(expr))
            }
            Expression::Case {
                when_clauses,
                else_clause,
            } => {
                let mut s = String::from("CASE");
                for (when, then) in when_clauses {
                    s.push_str(&format!(
                        " WHEN {} THEN {}",
                        self.render_expr(when),
                        self.render_expr(then)
                    ));
                }
                if let Some(else_expr) = else_clause {
                    s.push_str(&format!(" ELSE {}", self.render_expr(else_expr)));
                }
                s.push_str(" END");
                s
            }
            Expression::Subquery(q) => format!("({})", self.render_select(q)),
            Expression::Exists(q) => format!("EXISTS ({})", self.render_select(q)),
            Expression::InList {
                expr,
                list,
                negated,
            } => {
                if list.is_empty() {
                    // IN () is not valid SQL; an empty list matches nothing.
                    return if *negated { "1 = 1" } else { "1 = 0" }.to_string();
                }
                let not_str = if *negated { "NOT " } else { "" };
                let items: Vec<String> = list.iter().map(|e| self.render_expr(e)).collect();
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_str,
                    items.join(", ")
                )
            }
            Expression::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let not_str = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_str,
                    self.render_select(subquery)
                )
            }
            Expression::IsNull { expr, negated } => {
                if *negated {
                    format!("{} IS NOT NULL", self.render_expr(expr))
                } else {
                    format!("{} IS NULL", self.render_expr(expr))
                }
            }
            Expression::Wildcard => "*".to_string(),
            Expression::Nested(expr) => format!("({})", self.render_expr(expr)),
        }
    }

    fn render_order_by(&self, order: &OrderByExpr) -> String {
        let mut s = self.render_expr(&order.expr);
        match order.asc {
            Some(true) => s.push_str(" ASC"),
            Some(false) => s.push_str(" DESC"),
            None => {}
        }
        s
    }

    fn render_insert(&self, insert: &InsertStatement) -> String {
        let body = if insert.columns.is_empty() {
            "DEFAULT VALUES".to_string()
        } else {
            let vals: Vec<String> = insert.values.iter().map(|v| self.render_expr(v)).collect();
            format!("({}) VALUES ({})", insert.columns.join(", "), vals.join(", "))
        };

        let returning = if insert.returning.is_empty() {
            String::new()
        } else {
            format!(" RETURNING {}", insert.returning.join(", "))
        };

        format!("INSERT INTO {} {}{}", insert.table, body, returning)
    }

    fn render_update(&self, update: &UpdateStatement) -> String {
        let sets: Vec<String> = update
            .assignments
            .iter()
            .map(|a| format!("{} = {}", a.column, self.render_expr(&a.value)))
            .collect();

        let filter = match &update.filter {
            Some(f) => format!(" WHERE {}", self.render_expr(f)),
            None => String::new(),
        };

        format!("UPDATE {} SET {}{}", update.table, sets.join(", "), filter)
    }

    fn render_delete(&self, delete: &DeleteStatement) -> String {
        let filter = match &delete.filter {
            Some(f) => format!(" WHERE {}", self.render_expr(f)),
            None => String::new(),
        };

        format!("DELETE FROM {}{}", delete.table, filter)
    }
}

fn render_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => {
            let s = format!("{}", f);
            if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                s
            } else {
                format!("{}.0", s)
            }
        }
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dialect;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn column(table: &str, name: &str) -> Expression {
        Expression::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    fn customers() -> SelectStatement {
        SelectStatement {
            projections: vec![SelectItem {
                expr: column("t0", "Name"),
                alias: None,
            }],
            from: vec![TableRef::Table {
                name: "Customers".to_string(),
                alias: Some("t0".to_string()),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_render_simple_select() {
        let sql = render(
            &Statement::Select(Box::new(customers())),
            &Dialect::default(),
        );
        assert_eq!(sql, "SELECT t0.Name FROM Customers t0");
    }

    #[test]
    fn test_render_parameters_per_dialect() {
        let mut select = customers();
        select.filter = Some(Expression::BinaryOp {
            left: Box::new(column("t0", "Name")),
            op: BinaryOperator::Eq,
            right: Box::new(Expression::Parameter {
                name: "p0".to_string(),
                ordinal: 0,
            }),
        });
        let statement = Statement::Select(Box::new(select));
        assert!(render(&statement, &Dialect::default()).ends_with("WHERE t0.Name = @p0"));
        assert!(render(&statement, &Dialect::postgres()).ends_with("WHERE t0.Name = $1"));
    }

    #[test]
    fn test_render_offset_fetch() {
        let mut select = customers();
        select.order_by.push(OrderByExpr {
            expr: column("t0", "Name"),
            asc: None,
        });
        select.limit = Some(Expression::Literal(Literal::Integer(10)));
        let sql = render(&Statement::Select(Box::new(select)), &Dialect::sql_server());
        assert!(sql.ends_with("ORDER BY t0.Name OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"));
    }

    #[test]
    fn test_render_empty_in_list() {
        let mut select = customers();
        select.filter = Some(Expression::InList {
            expr: Box::new(column("t0", "Name")),
            list: Vec::new(),
            negated: false,
        });
        let sql = render(&Statement::Select(Box::new(select)), &Dialect::default());
        assert!(sql.ends_with("WHERE 1 = 0"));
    }

    #[test]
    fn test_render_insert_default_values() {
        let insert = InsertStatement {
            table: "Audit".to_string(),
            columns: Vec::new(),
            values: Vec::new(),
            returning: vec!["Id".to_string()],
        };
        let sql = render(&Statement::Insert(insert), &Dialect::postgres());
        assert_eq!(sql, "INSERT INTO Audit DEFAULT VALUES RETURNING Id");
    }

    #[test]
    fn test_render_cast_and_extract() {
        let mut select = customers();
        select.projections = vec![
            SelectItem {
                expr: Expression::Cast {
                    expr: Box::new(column("t0", "Id")),
                    data_type: "TEXT".to_string(),
                },
                alias: Some("Label".to_string()),
            },
            SelectItem {
                expr: Expression::Extract {
                    field: "YEAR".to_string(),
                    expr: Box::new(column("t0", "Joined")),
                },
                alias: Some("Year".to_string()),
            },
        ];
        let sql = render(&Statement::Select(Box::new(select)), &Dialect::postgres());
        assert_eq!(
            sql,
            "SELECT CAST(t0.Id AS TEXT) AS Label, EXTRACT(YEAR FROM t0.Joined) AS Year FROM Customers t0"
        );
        assert!(Parser::parse_sql(&PostgreSqlDialect {}, &sql).is_ok(), "{}", sql);
    }

    #[test]
    fn test_render_string_literal_escaping() {
        assert_eq!(
            render_literal(&Literal::String("O'Brien".to_string())),
            "'O''Brien'"
        );
        assert_eq!(render_literal(&Literal::Float(2.0)), "2.0");
    }

    #[test]
    fn test_rendered_statements_reparse() {
        let mut select = customers();
        select.distinct = true;
        select.joins.push(Join {
            join_type: JoinType::Left,
            table: TableRef::Table {
                name: "Orders".to_string(),
                alias: Some("t1".to_string()),
            },
            condition: Some(Expression::BinaryOp {
                left: Box::new(column("t1", "CustomerId")),
                op: BinaryOperator::Eq,
                right: Box::new(column("t0", "Id")),
            }),
        });
        select.limit = Some(Expression::Parameter {
            name: "p0".to_string(),
            ordinal: 0,
        });
        let statements = vec![
            Statement::Select(Box::new(select)),
            Statement::Update(UpdateStatement {
                table: "Customers".to_string(),
                assignments: vec![Assignment {
                    column: "Name".to_string(),
                    value: Expression::Parameter {
                        name: "Name".to_string(),
                        ordinal: 0,
                    },
                }],
                filter: Some(Expression::BinaryOp {
                    left: Box::new(Expression::Column {
                        table: None,
                        name: "Id".to_string(),
                    }),
                    op: BinaryOperator::Eq,
                    right: Box::new(Expression::Parameter {
                        name: "Id".to_string(),
                        ordinal: 1,
                    }),
                }),
            }),
            Statement::Delete(DeleteStatement {
                table: "Customers".to_string(),
                filter: None,
            }),
        ];

        for statement in &statements {
            let sql = render(statement, &Dialect::postgres());
            let reparsed = Parser::parse_sql(&PostgreSqlDialect {}, &sql);
            assert!(
                reparsed.is_ok(),
                "Rendered SQL failed to parse: {} -> {:?}",
                sql,
                reparsed.err()
            );
        }
    }
}
