//! Two-operand arithmetic synthetics.

use serde_json::{Number, Value};

use crate::error::{EngineError, EngineResult};
use crate::locator::ResourceLocator;
use crate::schema::sampled_type_name;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithmeticOp {
    /// `minuend - subtrahend`, keeping the operands' shared numeric
    /// representation.
    Difference,
    /// `dividend / divisor` as floating point, scaled by `factor`.
    Quotient { factor: f64 },
}

/// A derived attribute combining exactly two dependent locators through a
/// pure arithmetic combinator.
#[derive(Debug, Clone)]
pub struct ArithmeticSynthetic {
    locator: ResourceLocator,
    op: ArithmeticOp,
    left: ResourceLocator,
    right: ResourceLocator,
    display_name: String,
    description: String,
}

impl ArithmeticSynthetic {
    pub fn difference(
        locator: ResourceLocator,
        minuend: ResourceLocator,
        subtrahend: ResourceLocator,
    ) -> Self {
        with_op(locator, ArithmeticOp::Difference, minuend, subtrahend)
    }

    pub fn quotient(
        locator: ResourceLocator,
        dividend: ResourceLocator,
        divisor: ResourceLocator,
    ) -> Self {
        with_op(
            locator,
            ArithmeticOp::Quotient { factor: 1.0 },
            dividend,
            divisor,
        )
    }

    /// Scale factor applied to quotient results; ignored for differences.
    pub fn with_factor(mut self, factor: f64) -> Self {
        if let ArithmeticOp::Quotient { factor: f } = &mut self.op {
            *f = factor;
        }
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    pub fn op(&self) -> ArithmeticOp {
        self.op
    }

    pub(crate) fn dependent_locators(&self) -> Vec<ResourceLocator> {
        vec![self.left.clone(), self.right.clone()]
    }

    pub(crate) fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn left(&self) -> &ResourceLocator {
        &self.left
    }

    /// Applies the combinator to fetched operand values.
    pub fn combine(&self, left: &Value, right: &Value) -> EngineResult<Value> {
        match self.op {
            ArithmeticOp::Difference => difference_value(left, right),
            ArithmeticOp::Quotient { factor } => {
                let dividend = numeric_operand(left)?;
                let divisor = numeric_operand(right)?;
                if divisor == 0.0 {
                    return Err(EngineError::InvalidOperands(format!(
                        "division by zero evaluating {}",
                        self.locator
                    )));
                }
                Number::from_f64(dividend / divisor * factor)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        EngineError::InvalidOperands(format!(
                            "non-finite quotient evaluating {}",
                            self.locator
                        ))
                    })
            }
        }
    }
}

fn with_op(
    locator: ResourceLocator,
    op: ArithmeticOp,
    left: ResourceLocator,
    right: ResourceLocator,
) -> ArithmeticSynthetic {
    let display_name = locator.base_attribute_name().to_owned();
    ArithmeticSynthetic {
        locator,
        op,
        left,
        right,
        display_name,
        description: String::new(),
    }
}

/// Subtraction keeping the operands' shared numeric representation:
/// integer operands yield an integer, floating operands yield a float,
/// a mix is rejected.
pub(crate) fn difference_value(left: &Value, right: &Value) -> EngineResult<Value> {
    if let (Value::Number(l), Value::Number(r)) = (left, right) {
        if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
            return l.checked_sub(r).map(Value::from).ok_or_else(|| {
                EngineError::InvalidOperands("integer overflow in subtraction".to_owned())
            });
        }
        if l.is_f64() && r.is_f64() {
            if let (Some(l), Some(r)) = (l.as_f64(), r.as_f64()) {
                return Number::from_f64(l - r).map(Value::Number).ok_or_else(|| {
                    EngineError::InvalidOperands("non-finite subtraction result".to_owned())
                });
            }
        }
    }
    Err(EngineError::InvalidOperands(format!(
        "subtraction needs one shared numeric representation, got {} and {}",
        sampled_type_name(left),
        sampled_type_name(right)
    )))
}

fn numeric_operand(value: &Value) -> EngineResult<f64> {
    value.as_f64().ok_or_else(|| {
        EngineError::InvalidOperands(format!(
            "expected a numeric operand, got {}",
            sampled_type_name(value)
        ))
    })
}
