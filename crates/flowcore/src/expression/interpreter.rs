//! Tree-walking evaluator over [`Expr`].
//!
//! Values read from the context are borrowed where possible; only results
//! that are actually computed get allocated.

use super::ast::{BinaryOp, Expr, ExprKind, LogicalOp, UnaryOp};
use super::forbidden::is_forbidden;
use super::functions::{self, compare, Call, FunctionKind, HigherOrder};
use super::ExpressionLimits;
use crate::context::ExpressionContext;
use crate::error::ExpressionError;
use crate::value::{loose_eq, number, Map, Value, ValueExt};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, ExpressionError>;

static NULL: Value = Value::Null;

/// How often (in steps) the wall clock is consulted.
const CLOCK_CHECK_INTERVAL: u64 = 256;

/// Step, time and size allowance for one template evaluation.
#[derive(Debug)]
pub(crate) struct Budget {
    steps: u64,
    max_steps: u64,
    started: Instant,
    max_duration: Duration,
    max_string_length: usize,
    max_collection_length: usize,
}

impl Budget {
    pub(crate) fn new(limits: &ExpressionLimits) -> Self {
        Self {
            steps: 0,
            max_steps: limits.max_steps,
            started: Instant::now(),
            max_duration: Duration::from_millis(limits.max_duration_ms),
            max_string_length: limits.max_string_length,
            max_collection_length: limits.max_collection_length,
        }
    }

    pub(crate) fn charge(&mut self, work: u64, offset: usize) -> Result<()> {
        let before = self.steps;
        self.steps = self.steps.saturating_add(work.max(1));
        if self.steps > self.max_steps {
            return Err(ExpressionError::exceeded(
                format!("evaluation exceeded {} steps", self.max_steps),
                offset,
            ));
        }
        if before / CLOCK_CHECK_INTERVAL != self.steps / CLOCK_CHECK_INTERVAL
            && self.started.elapsed() > self.max_duration
        {
            return Err(ExpressionError::exceeded(
                format!(
                    "evaluation exceeded {}ms",
                    self.max_duration.as_millis()
                ),
                offset,
            ));
        }
        Ok(())
    }

    pub(crate) fn check_string(&self, len: usize, offset: usize) -> Result<()> {
        if len > self.max_string_length {
            return Err(ExpressionError::exceeded(
                format!(
                    "string of {len} bytes exceeds the limit of {}",
                    self.max_string_length
                ),
                offset,
            ));
        }
        Ok(())
    }

    pub(crate) fn check_collection(&self, len: usize, offset: usize) -> Result<()> {
        if len > self.max_collection_length {
            return Err(ExpressionError::exceeded(
                format!(
                    "collection of {len} items exceeds the limit of {}",
                    self.max_collection_length
                ),
                offset,
            ));
        }
        Ok(())
    }
}

/// Evaluate a parsed expression against `ctx`.
pub(crate) fn evaluate(expr: &Expr, ctx: &ExpressionContext, budget: &mut Budget) -> Result<Value> {
    let mut interpreter = Interpreter {
        ctx,
        budget,
        locals: Vec::new(),
    };
    interpreter.eval(expr).map(Cow::into_owned)
}

struct Interpreter<'a, 'b> {
    ctx: &'a ExpressionContext,
    budget: &'b mut Budget,
    /// Bound lambda parameters, innermost last.
    locals: Vec<(String, Value)>,
}

impl<'a> Interpreter<'a, '_> {
    fn eval(&mut self, expr: &'a Expr) -> Result<Cow<'a, Value>> {
        self.budget.charge(1, expr.offset)?;
        let offset = expr.offset;

        match &expr.kind {
            ExprKind::Literal(value) => Ok(Cow::Borrowed(value)),
            ExprKind::Variable(name) => Ok(Cow::Borrowed(self.ctx.variable(name).unwrap_or(&NULL))),
            ExprKind::Local(name) => Ok(Cow::Owned(
                self.locals
                    .iter()
                    .rev()
                    .find(|(local, _)| local == name)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(Value::Null),
            )),
            ExprKind::Member { object, property } => {
                let object = self.eval(object)?;
                member(object, property, offset)
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match index.as_ref() {
                    Value::String(key) => member(object, key, offset),
                    Value::Number(n) => Ok(element(object, n.as_f64().unwrap_or(f64::NAN))),
                    other => Err(ExpressionError::runtime(
                        format!("cannot index with {}", other.type_name()),
                        offset,
                    )),
                }
            }
            ExprKind::Call { function, args } => self.call(function, args, offset).map(Cow::Owned),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Cow::Owned(Value::Bool(!value.is_truthy()))),
                    UnaryOp::Neg => match value.to_f64() {
                        Some(n) => Ok(Cow::Owned(number(-n))),
                        None => Err(ExpressionError::runtime(
                            format!("cannot negate {}", value.type_name()),
                            offset,
                        )),
                    },
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.binary(*op, lhs, rhs, offset).map(Cow::Owned)
            }
            ExprKind::Logical { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let take_lhs = match op {
                    LogicalOp::And => !lhs.is_truthy(),
                    LogicalOp::Or => lhs.is_truthy(),
                    LogicalOp::Coalesce => !lhs.is_null(),
                };
                if take_lhs {
                    Ok(lhs)
                } else {
                    self.eval(rhs)
                }
            }
            ExprKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            ExprKind::Array(items) => {
                self.budget.check_collection(items.len(), offset)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?.into_owned());
                }
                Ok(Cow::Owned(Value::Array(out)))
            }
            ExprKind::Object(entries) => {
                self.budget.check_collection(entries.len(), offset)?;
                let mut out = Map::new();
                for (key, value) in entries {
                    out.insert(key.clone(), self.eval(value)?.into_owned());
                }
                Ok(Cow::Owned(Value::Object(out)))
            }
            ExprKind::Lambda { .. } => Err(ExpressionError::runtime(
                "a lambda cannot be used as a value",
                offset,
            )),
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: Cow<'a, Value>,
        rhs: Cow<'a, Value>,
        offset: usize,
    ) -> Result<Value> {
        if op == BinaryOp::Add {
            return self.add(lhs, rhs, offset);
        }

        let (l, r) = (lhs.as_ref(), rhs.as_ref());
        match op {
            BinaryOp::Eq => return Ok(Value::Bool(loose_eq(l, r))),
            BinaryOp::NotEq => return Ok(Value::Bool(!loose_eq(l, r))),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ordering = compare(l, r).ok_or_else(|| {
                    ExpressionError::runtime(
                        format!(
                            "cannot compare {} with {} using '{}'",
                            l.type_name(),
                            r.type_name(),
                            op.symbol()
                        ),
                        offset,
                    )
                })?;
                let result = match op {
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::LtEq => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                return Ok(Value::Bool(result));
            }
            _ => {}
        }

        let (Some(x), Some(y)) = (l.to_f64(), r.to_f64()) else {
            return Err(ExpressionError::runtime(
                format!(
                    "'{}' expects numbers, got {} and {}",
                    op.symbol(),
                    l.type_name(),
                    r.type_name()
                ),
                offset,
            ));
        };
        let result = match op {
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div | BinaryOp::Rem if y == 0.0 => {
                return Err(ExpressionError::runtime("division by zero", offset));
            }
            BinaryOp::Div => x / y,
            _ => x % y,
        };
        Ok(number(result))
    }

    fn add(&mut self, lhs: Cow<'a, Value>, rhs: Cow<'a, Value>, offset: usize) -> Result<Value> {
        match (lhs.as_ref(), rhs.as_ref()) {
            (Value::Number(x), Value::Number(y)) => {
                Ok(number(x.as_f64().unwrap_or(f64::NAN) + y.as_f64().unwrap_or(f64::NAN)))
            }
            (Value::Array(x), Value::Array(y)) => {
                let total = x.len() + y.len();
                self.budget.check_collection(total, offset)?;
                let mut out = match lhs.into_owned() {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                };
                if let Value::Array(more) = rhs.into_owned() {
                    out.extend(more);
                }
                Ok(Value::Array(out))
            }
            (Value::String(_), _) | (_, Value::String(_)) => {
                let (l, r) = (lhs.to_display_string(), rhs.to_display_string());
                self.budget.check_string(l.len() + r.len(), offset)?;
                Ok(Value::String(l + &r))
            }
            (l, r) => Err(ExpressionError::runtime(
                format!("'+' cannot combine {} and {}", l.type_name(), r.type_name()),
                offset,
            )),
        }
    }

    fn call(&mut self, name: &str, args: &'a [Expr], offset: usize) -> Result<Value> {
        let function = functions::lookup(name).ok_or_else(|| {
            ExpressionError::forbidden(format!("function '{name}' is not allowed"), offset)
        })?;

        match function.kind {
            FunctionKind::Pure(f) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?.into_owned());
                }
                let mut call = Call {
                    name: function.name,
                    args: values,
                    budget: &mut *self.budget,
                    now: self.ctx.now(),
                    offset,
                };
                f(&mut call)
            }
            FunctionKind::HigherOrder(kind) => self.higher_order(kind, function.name, args, offset),
        }
    }

    fn higher_order(
        &mut self,
        kind: HigherOrder,
        name: &str,
        args: &'a [Expr],
        offset: usize,
    ) -> Result<Value> {
        let collection = self.eval(&args[0])?;
        let items: &[Value] = match collection.as_ref() {
            Value::Array(items) => items,
            Value::Null => &[],
            other => {
                return Err(ExpressionError::runtime(
                    format!("{name}(): argument 1 must be an array, got {}", other.type_name()),
                    offset,
                ))
            }
        };
        let ExprKind::Lambda { params, body } = &args[1].kind else {
            return Err(ExpressionError::runtime(
                format!("{name}(): argument 2 must be a lambda"),
                offset,
            ));
        };

        match kind {
            HigherOrder::Map => {
                self.budget.check_collection(items.len(), offset)?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.apply(params, body, vec![item.clone(), Value::from(i)])?);
                }
                Ok(Value::Array(out))
            }
            HigherOrder::Filter => {
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if self.apply(params, body, vec![item.clone(), Value::from(i)])?.is_truthy() {
                        out.push(item.clone());
                    }
                }
                Ok(Value::Array(out))
            }
            HigherOrder::Find => {
                for (i, item) in items.iter().enumerate() {
                    if self.apply(params, body, vec![item.clone(), Value::from(i)])?.is_truthy() {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Null)
            }
            HigherOrder::Some | HigherOrder::Every => {
                let want = kind == HigherOrder::Some;
                for (i, item) in items.iter().enumerate() {
                    let hit = self.apply(params, body, vec![item.clone(), Value::from(i)])?.is_truthy();
                    if hit == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            HigherOrder::Reduce => {
                let mut acc = self.eval(&args[2])?.into_owned();
                for (i, item) in items.iter().enumerate() {
                    acc = self.apply(params, body, vec![acc, item.clone(), Value::from(i)])?;
                }
                Ok(acc)
            }
            HigherOrder::SortBy => {
                let mut keyed = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let key = self.apply(params, body, vec![item.clone(), Value::from(i)])?;
                    keyed.push((key, item.clone()));
                }
                if !keyed.windows(2).all(|w| compare(&w[0].0, &w[1].0).is_some()) {
                    return Err(ExpressionError::runtime(
                        format!("{name}(): keys must be all numbers or all strings"),
                        offset,
                    ));
                }
                keyed.sort_by(|a, b| compare(&a.0, &b.0).unwrap_or(Ordering::Equal));
                Ok(Value::Array(keyed.into_iter().map(|(_, item)| item).collect()))
            }
        }
    }

    /// Bind `args` to `params` and evaluate `body`. Extra arguments are dropped.
    fn apply(&mut self, params: &[String], body: &'a Expr, args: Vec<Value>) -> Result<Value> {
        let outer = self.locals.len();
        self.locals
            .extend(params.iter().cloned().zip(args));
        let result = self.eval(body).map(Cow::into_owned);
        self.locals.truncate(outer);
        result
    }
}

fn member<'a>(object: Cow<'a, Value>, key: &str, offset: usize) -> Result<Cow<'a, Value>> {
    if is_forbidden(key) {
        return Err(ExpressionError::forbidden(
            format!("'{key}' is not allowed in expressions"),
            offset,
        ));
    }
    let value = match object {
        Cow::Borrowed(Value::Object(map)) => {
            return Ok(map.get(key).map(Cow::Borrowed).unwrap_or(Cow::Owned(Value::Null)))
        }
        Cow::Owned(Value::Object(mut map)) => map.remove(key).unwrap_or(Value::Null),
        other if key == "length" => match other.as_ref() {
            Value::String(s) => Value::from(s.chars().count() as u64),
            Value::Array(items) => Value::from(items.len() as u64),
            _ => Value::Null,
        },
        _ => Value::Null,
    };
    Ok(Cow::Owned(value))
}

/// Element at `index` of an array or string; negative indexes count from the end.
fn element(object: Cow<'_, Value>, index: f64) -> Cow<'_, Value> {
    if index.fract() != 0.0 || !index.is_finite() {
        return Cow::Owned(Value::Null);
    }
    let resolve = |len: usize| -> Option<usize> {
        let i = if index < 0.0 { len as f64 + index } else { index };
        (i >= 0.0 && i < len as f64).then_some(i as usize)
    };

    match object {
        Cow::Borrowed(Value::Array(items)) => resolve(items.len())
            .map(|i| Cow::Borrowed(&items[i]))
            .unwrap_or(Cow::Owned(Value::Null)),
        Cow::Owned(Value::Array(mut items)) => Cow::Owned(
            resolve(items.len())
                .map(|i| items.swap_remove(i))
                .unwrap_or(Value::Null),
        ),
        other => match other.as_ref() {
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                Cow::Owned(
                    resolve(chars.len())
                        .map(|i| Value::String(chars[i].to_string()))
                        .unwrap_or(Value::Null),
                )
            }
            _ => Cow::Owned(Value::Null),
        },
    }
}
