//! Call-site argument adaptation for mapped functions.
//!
//! Two conversions are applied before the usual arity and type checks:
//! - a trailing variadic parameter packs the remaining arguments into one
//!   array, unless exactly one array argument is supplied for it;
//! - a function whose single parameter is an array accepts one
//!   non-array argument and wraps it.
//!
//! Every failing position is collected into one conversion error.

use crate::ast::{ExpressionNode, Method, SqlOperator, ValueType};
use crate::error::{ArgumentError, CompileError, Result};
use crate::schema::FunctionParameter;

/// An analyzed argument with its static type.
#[derive(Debug, Clone)]
pub struct Argument {
    pub node: ExpressionNode,
    pub value_type: ValueType,
}

fn array_of(nodes: Vec<ExpressionNode>) -> ExpressionNode {
    ExpressionNode::call(Method::Sql(SqlOperator::List), nodes)
}

fn check(
    position: usize,
    parameter: &FunctionParameter,
    argument: &Argument,
    errors: &mut Vec<ArgumentError>,
) {
    if !parameter.value_type.accepts(&argument.value_type) {
        errors.push(ArgumentError::new(
            position,
            parameter.name.clone(),
            format!("expected {}, found {}", parameter.value_type, argument.value_type),
        ));
    }
}

fn check_element(
    position: usize,
    parameter: &FunctionParameter,
    argument: &Argument,
    errors: &mut Vec<ArgumentError>,
) {
    let element = parameter.value_type.element().unwrap_or(&ValueType::Any);
    if !element.accepts(&argument.value_type) {
        errors.push(ArgumentError::new(
            position,
            parameter.name.clone(),
            format!("expected {}, found {}", element, argument.value_type),
        ));
    }
}

/// Match supplied arguments to declared parameters.
pub fn adapt_arguments(
    parameters: &[FunctionParameter],
    arguments: Vec<Argument>,
) -> Result<Vec<ExpressionNode>> {
    let mut errors = Vec::new();
    let mut adapted = Vec::with_capacity(parameters.len());

    match parameters.split_last() {
        Some((last, fixed)) if last.variadic => {
            let mut supplied = arguments.into_iter();
            for (position, parameter) in fixed.iter().enumerate() {
                match supplied.next() {
                    Some(argument) => {
                        check(position, parameter, &argument, &mut errors);
                        adapted.push(argument.node);
                    }
                    None => errors.push(ArgumentError::new(
                        position,
                        parameter.name.clone(),
                        "missing argument",
                    )),
                }
            }

            let rest: Vec<Argument> = supplied.collect();
            let base = fixed.len();
            if rest.len() == 1 && rest[0].value_type.is_array() {
                check(base, last, &rest[0], &mut errors);
                adapted.extend(rest.into_iter().map(|a| a.node));
            } else {
                for (offset, argument) in rest.iter().enumerate() {
                    check_element(base + offset, last, argument, &mut errors);
                }
                adapted.push(array_of(rest.into_iter().map(|a| a.node).collect()));
            }
        }
        Some((only, [])) if only.value_type.is_array()
            && arguments.len() == 1
            && !arguments[0].value_type.is_array() =>
        {
            check_element(0, only, &arguments[0], &mut errors);
            adapted.push(array_of(arguments.into_iter().map(|a| a.node).collect()));
        }
        _ => {
            let count = parameters.len().max(arguments.len());
            let mut supplied = arguments.into_iter();
            for position in 0..count {
                match (parameters.get(position), supplied.next()) {
                    (Some(parameter), Some(argument)) => {
                        check(position, parameter, &argument, &mut errors);
                        adapted.push(argument.node);
                    }
                    (Some(parameter), None) => errors.push(ArgumentError::new(
                        position,
                        parameter.name.clone(),
                        "missing argument",
                    )),
                    (None, Some(_)) => errors.push(ArgumentError::new(
                        position,
                        format!("#{}", position),
                        "unexpected argument",
                    )),
                    (None, None) => {}
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(adapted)
    } else {
        Err(CompileError::Conversion(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, value_type: ValueType) -> FunctionParameter {
        FunctionParameter {
            name: name.to_string(),
            value_type,
            variadic: false,
        }
    }

    fn variadic(name: &str, element: ValueType) -> FunctionParameter {
        FunctionParameter {
            name: name.to_string(),
            value_type: ValueType::Array(Box::new(element)),
            variadic: true,
        }
    }

    fn arg(value: i64) -> Argument {
        Argument {
            node: ExpressionNode::constant(value),
            value_type: ValueType::Int,
        }
    }

    fn text(value: &str) -> Argument {
        Argument {
            node: ExpressionNode::constant(value),
            value_type: ValueType::Text,
        }
    }

    fn list_len(node: &ExpressionNode) -> Option<usize> {
        match node {
            ExpressionNode::Call {
                method: Method::Sql(SqlOperator::List),
                args,
                ..
            } => Some(args.len()),
            _ => None,
        }
    }

    #[test]
    fn test_variadic_packs_trailing_arguments() {
        let params = [param("seed", ValueType::Int), variadic("values", ValueType::Int)];
        let adapted = adapt_arguments(&params, vec![arg(1), arg(2), arg(3), arg(4)]).unwrap();
        assert_eq!(adapted.len(), 2);
        assert_eq!(list_len(&adapted[1]), Some(3));
    }

    #[test]
    fn test_variadic_with_no_trailing_arguments() {
        let params = [param("seed", ValueType::Int), variadic("values", ValueType::Int)];
        let adapted = adapt_arguments(&params, vec![arg(1)]).unwrap();
        assert_eq!(list_len(&adapted[1]), Some(0));
    }

    #[test]
    fn test_variadic_passes_an_array_through() {
        let params = [variadic("values", ValueType::Int)];
        let array = Argument {
            node: ExpressionNode::constant(vec![1, 2]),
            value_type: ValueType::Array(Box::new(ValueType::Int)),
        };
        let adapted = adapt_arguments(&params, vec![array]).unwrap();
        assert_eq!(list_len(&adapted[0]), None);
    }

    #[test]
    fn test_single_array_parameter_wraps_scalar() {
        let params = [param("ids", ValueType::Array(Box::new(ValueType::Int)))];
        let adapted = adapt_arguments(&params, vec![arg(7)]).unwrap();
        assert_eq!(list_len(&adapted[0]), Some(1));
    }

    #[test]
    fn test_reports_every_failing_position() {
        let params = [
            param("a", ValueType::Int),
            param("b", ValueType::Int),
            param("c", ValueType::Text),
        ];
        let err = adapt_arguments(&params, vec![text("x"), arg(1)]).unwrap_err();
        assert_eq!(err.positions(), vec![0, 2]);
        let message = err.to_string();
        assert!(message.contains("expected int, found text"));
        assert!(message.contains("missing argument"));
    }

    #[test]
    fn test_variadic_element_mismatch_names_position() {
        let params = [param("seed", ValueType::Int), variadic("values", ValueType::Int)];
        let err = adapt_arguments(&params, vec![arg(1), arg(2), text("x")]).unwrap_err();
        assert_eq!(err.positions(), vec![2]);
    }

    #[test]
    fn test_extra_argument_is_rejected() {
        let params = [param("a", ValueType::Int)];
        let err = adapt_arguments(&params, vec![arg(1), arg(2)]).unwrap_err();
        assert_eq!(err.positions(), vec![1]);
    }
}
