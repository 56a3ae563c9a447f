use std::fmt;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Concat,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Concat => "~",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Parsed expression tree. Filters (`x | f(a)`) are desugared into `Call { f, [x, a] }`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(JsonValue),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Pre-order visit of every node.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Var(_) => {}
            Expr::List(items) => items.iter().for_each(|e| e.walk(f)),
            Expr::Object(entries) => entries.iter().for_each(|(_, e)| e.walk(f)),
            Expr::Member(base, _) => base.walk(f),
            Expr::Index(base, key) => {
                base.walk(f);
                key.walk(f);
            }
            Expr::Call { args, .. } => args.iter().for_each(|e| e.walk(f)),
            Expr::Unary(_, e) => e.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
        }
    }

    /// Names of every function called in the tree.
    pub fn function_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Call { name, .. } = e {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Step ids referenced as `steps.<id>` or `steps["<id>"]`.
    pub fn step_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |e| match e {
            Expr::Member(base, field) if is_steps_root(base) => out.push(field.as_str()),
            Expr::Index(base, key) if is_steps_root(base) => {
                if let Expr::Literal(JsonValue::String(id)) = key.as_ref() {
                    out.push(id.as_str());
                }
            }
            _ => {}
        });
        out
    }
}

fn is_steps_root(e: &Expr) -> bool {
    matches!(e, Expr::Var(name) if name == "steps")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Expr::Object(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {v}", JsonValue::String(k.clone()))?;
                }
                f.write_str("}")
            }
            Expr::Var(name) => f.write_str(name),
            Expr::Member(base, field) => write!(f, "{base}.{field}"),
            Expr::Index(base, key) => write!(f, "{base}[{key}]"),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                write_joined(f, args)?;
                f.write_str(")")
            }
            Expr::Unary(UnaryOp::Not, e) => write!(f, "not {e}"),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{e}"),
            Expr::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
