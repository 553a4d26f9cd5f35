#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use ctu_ast::{
    BUILTIN_TYPES, Block, Decl, Expr, ExprKind, FunctionBody, FunctionDecl, Ident, Position, Stmt, TypeExpr,
    TypeKind, Unit, VarDecl, path_string,
};
use tracing::debug;

use crate::error::UnresolvedNameError;

/// Frame index holding top-level declarations; frame 0 holds builtins.
const TOP_LEVEL: usize = 1;

/// Where a name reference was found. `depth` is the index of the frame that
/// declared it, counted from the outermost (builtin) frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub position: Position,
    pub depth: usize,
}

/// Checks that every name reference in a unit has a reachable declaration.
///
/// Frames are plain name sets. Lookup walks them innermost first and tests
/// membership of the exact identifier.
pub struct Validator {
    frames: Vec<HashSet<String>>,
    enums: HashMap<String, HashSet<String>>,
    errors: Vec<UnresolvedNameError>,
    resolutions: Vec<Resolution>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        let builtins = BUILTIN_TYPES.iter().map(|(name, _)| name.to_string()).collect();
        Self {
            frames: vec![builtins],
            enums: HashMap::new(),
            errors: Vec::new(),
            resolutions: Vec::new(),
        }
    }

    pub fn check_unit(mut self, unit: &Unit) -> (Vec<UnresolvedNameError>, Vec<Resolution>) {
        self.push_scope();

        // First pass: every top-level name is visible to every body.
        for decl in &unit.decls {
            match decl {
                Decl::Include(inc) => {
                    for name in inc.bound_names() {
                        self.declare(name);
                    }
                    if let Some(root) = inc.path.first() {
                        self.declare(root);
                    }
                }
                Decl::Alias(a) => self.declare(&a.name),
                Decl::Struct(s) => self.declare(&s.name),
                Decl::Union(u) => self.declare(&u.name),
                Decl::Enum(e) => {
                    self.declare(&e.name);
                    self.enums.insert(
                        e.name.node.clone(),
                        e.members.iter().map(|m| m.name.node.clone()).collect(),
                    );
                }
                Decl::Function(f) => self.declare(&f.name),
                Decl::Global(g) => {
                    for binding in &g.names {
                        self.declare(&binding.name);
                    }
                }
            }
        }

        // Second pass: bodies.
        for decl in &unit.decls {
            match decl {
                Decl::Include(_) => {}
                Decl::Alias(a) => self.check_type(&a.target),
                Decl::Struct(s) => {
                    self.push_scope();
                    for p in &s.params {
                        self.declare(p);
                    }
                    for cap in &s.capabilities {
                        self.check_type(&cap.base);
                    }
                    for field in &s.fields {
                        self.check_type(&field.ty);
                    }
                    self.pop_scope();
                }
                Decl::Union(u) => {
                    self.push_scope();
                    for p in &u.params {
                        self.declare(p);
                    }
                    for field in &u.fields {
                        self.check_type(&field.ty);
                    }
                    self.pop_scope();
                }
                Decl::Enum(e) => {
                    if let Some(backing) = &e.backing {
                        self.check_type(backing);
                    }
                    for member in &e.members {
                        if let Some(value) = &member.value {
                            self.check_expr(value);
                        }
                    }
                }
                Decl::Function(f) => self.check_function(f),
                Decl::Global(g) => {
                    if let Some(init) = &g.init {
                        self.check_expr(init);
                    }
                    for binding in &g.names {
                        if let Some(ty) = &binding.ty {
                            self.check_type(ty);
                        }
                    }
                }
            }
        }

        self.pop_scope();
        debug!(
            unresolved = self.errors.len(),
            references = self.resolutions.len(),
            "scope validation finished"
        );
        (self.errors, self.resolutions)
    }

    fn check_function(&mut self, f: &FunctionDecl) {
        self.push_scope();
        for p in &f.params {
            self.declare(p);
        }
        for arg in &f.args {
            self.check_type(&arg.ty);
            if let Some(default) = &arg.default {
                self.check_expr(default);
            }
            self.declare(&arg.name);
        }
        if let Some(result) = &f.result {
            self.check_type(result);
        }
        match &f.body {
            Some(FunctionBody::Block(block)) => self.check_block(block),
            Some(FunctionBody::Expr(expr)) => self.check_expr(expr),
            None => {}
        }
        self.pop_scope();
    }

    fn check_block(&mut self, block: &Block) {
        self.push_scope();
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        self.pop_scope();
    }

    /// The initializer is checked before the bindings become visible, so
    /// `let x = x;` refers to an outer `x`.
    fn check_var_decl(&mut self, var: &VarDecl) {
        if let Some(init) = &var.init {
            self.check_expr(init);
        }
        for binding in &var.names {
            if let Some(ty) = &binding.ty {
                self.check_type(ty);
            }
            self.declare(&binding.name);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Var(var) => self.check_var_decl(var),
            Stmt::Expr(expr) => self.check_expr(expr),
            Stmt::Block(block) => self.check_block(block),
            Stmt::Branch(branch) => {
                for path in &branch.paths {
                    self.check_expr(&path.cond);
                    self.check_block(&path.body);
                }
                if let Some(else_body) = &branch.else_body {
                    self.check_block(else_body);
                }
            }
            Stmt::ForRange(f) => {
                self.check_expr(&f.iterable);
                self.push_scope();
                for name in &f.names {
                    self.declare(name);
                }
                self.check_block(&f.body);
                self.pop_scope();
            }
            Stmt::ForC(f) => {
                self.push_scope();
                if let Some(init) = &f.init {
                    self.check_stmt(init);
                }
                if let Some(cond) = &f.cond {
                    self.check_expr(cond);
                }
                if let Some(step) = &f.step {
                    self.check_expr(step);
                }
                self.check_block(&f.body);
                self.pop_scope();
            }
            Stmt::While(w) => {
                self.check_expr(&w.cond);
                self.push_scope();
                self.check_block(&w.body);
                self.pop_scope();
            }
            Stmt::Switch(s) => {
                self.check_expr(&s.scrutinee);
                for case in &s.cases {
                    self.check_expr(&case.value);
                    self.check_block(&case.body);
                }
                if let Some(default) = &s.default {
                    self.check_block(default);
                }
            }
            Stmt::Return(r) => {
                if let Some(value) = &r.value {
                    self.check_expr(value);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) => {}
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(path) => self.resolve_path(path),
            ExprKind::IntLit { .. }
            | ExprKind::FloatLit(_)
            | ExprKind::StringLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::Null => {}
            ExprKind::Unary { operand, .. } => self.check_expr(operand),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Elvis { lhs, rhs } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond);
                self.check_expr(then);
                self.check_expr(otherwise);
            }
            ExprKind::Call { callee, args } => {
                self.check_expr(callee);
                for arg in args {
                    self.check_expr(arg);
                }
            }
            ExprKind::Subscript { base, index } => {
                self.check_expr(base);
                self.check_expr(index);
            }
            // Field names depend on types, which are resolved during lowering.
            ExprKind::Member { base, .. } | ExprKind::DerefMember { base, .. } => self.check_expr(base),
            ExprKind::Cast { ty, expr } => {
                self.check_type(ty);
                self.check_expr(expr);
            }
            ExprKind::Unwrap(inner) => self.check_expr(inner),
            ExprKind::TemplateInst { base, args } => {
                self.resolve_path(base);
                for arg in args {
                    self.check_type(arg);
                }
            }
        }
    }

    fn check_type(&mut self, ty: &TypeExpr) {
        match &ty.kind {
            TypeKind::Builtin(_) => {}
            TypeKind::Pointer(inner) | TypeKind::Const(inner) => self.check_type(inner),
            TypeKind::Array { elem, bound } => {
                self.check_type(elem);
                if let Some(bound) = bound {
                    self.check_expr(bound);
                }
            }
            TypeKind::Closure { args, result } => {
                for arg in args {
                    self.check_type(arg);
                }
                self.check_type(result);
            }
            TypeKind::Named(path) => self.resolve_path(path),
            TypeKind::Template { base, args } => {
                self.resolve_path(base);
                for arg in args {
                    self.check_type(arg);
                }
            }
        }
    }

    /// Only the first segment must be declared; the rest name members of an
    /// included module, which are checked only for enums of this unit.
    fn resolve_path(&mut self, path: &[Ident]) {
        let Some(first) = path.first() else { return };
        let Some(depth) = self.lookup(&first.node) else {
            self.errors.push(UnresolvedNameError::new(&first.node, first.span));
            return;
        };
        self.resolutions.push(Resolution {
            name: first.node.clone(),
            position: first.span.start,
            depth,
        });

        if depth != TOP_LEVEL {
            return;
        }
        if let (Some(members), Some(member)) = (self.enums.get(&first.node), path.get(1)) {
            if path.len() > 2 || !members.contains(&member.node) {
                let span = first.span.to(path[path.len() - 1].span);
                self.errors.push(UnresolvedNameError::new(path_string(path), span));
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        (0..self.frames.len())
            .rev()
            .find(|&idx| self.frames[idx].contains(name))
    }

    fn declare(&mut self, name: &Ident) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.node.clone());
        }
    }

    fn push_scope(&mut self) {
        self.frames.push(HashSet::new());
    }

    fn pop_scope(&mut self) {
        let _ = self.frames.pop();
    }
}
