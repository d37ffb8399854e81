use serde::{Deserialize, Serialize};

/// Binary operators. Compound assignment reuses these — the assignment node
/// wraps the operator with its own load/store pair at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtE,
    GtE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Negate,
    BitNot,
    Incr,
    Decr,
}

/// Expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,

    /// Variable reference; resolved to a local, capture, or global at
    /// compile time.
    Name(String),

    /// `[a, b, c]`
    Array(Vec<Expr>),

    /// `{ x = 1, y = 2 }`
    Object(Vec<(String, Expr)>),

    /// `a[i]`; member access `a.b` parses to this with a string index.
    Index { object: Box<Expr>, index: Box<Expr> },

    Call { callee: Box<Expr>, args: Vec<Expr> },

    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },

    /// `-e`, `~e`, `++e`, `--e`
    Prefix { op: UnOp, expr: Box<Expr> },

    /// `e++`, `e--` — yields the value before the update.
    Postfix { op: UnOp, expr: Box<Expr> },

    /// `target = value` — yields the assigned value.
    Assign { target: Box<Expr>, value: Box<Expr> },

    /// `target op= value`
    OpAssign { op: BinOp, target: Box<Expr>, value: Box<Expr> },

    /// `function(a, b) { ... }`
    Lambda(Box<FunctionDef>),
}

impl Expr {
    /// Whether this node denotes an assignable location. A capability of the
    /// variant, decided once at parse time — assignment and the update
    /// operators refuse anything else before the compiler ever runs.
    pub fn is_storable(&self) -> bool {
        matches!(self, Expr::Name(_) | Expr::Index { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    /// Name bound to the packed surplus arguments, from `...rest`.
    pub vararg: Option<String>,
    pub body: Block,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr {
        expr: Expr,
        line: u32,
    },
    Local {
        names: Vec<String>,
        values: Vec<Expr>,
        line: u32,
    },
    If {
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
        line: u32,
    },
    While {
        cond: Expr,
        body: Block,
        line: u32,
    },
    For {
        init: Box<Stmt>,
        cond: Expr,
        step: Expr,
        body: Block,
        line: u32,
    },
    /// `for (local name in container)`
    ForEach {
        name: String,
        container: Expr,
        body: Block,
        line: u32,
    },
    Function(FunctionDef),
    Return {
        value: Option<Expr>,
        line: u32,
    },
    Block(Block),
}

/// A statement sequence forming one lexical scope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}
