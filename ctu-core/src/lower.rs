#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use ctu_ast::{
    BinOp, Block, BuiltinType, Capability, Decl, Decorator, EnumDecl, Expr, ExprKind, Field, FunctionBody,
    FunctionDecl, Ident, Span, Stmt, StructDecl, TypeExpr, TypeKind, UnaryOp, UnionDecl, Unit, VarDecl,
    path_string,
};
use ctu_ir::{
    AggregateKind, IrAggregate, IrAlias, IrClosure, IrEnum, IrExpr, IrField, IrFunction, IrGlobal, IrInclude,
    IrInt, IrModule, IrStmt, IrType, Linkage, aggregate_order,
};
use tracing::{debug, warn};

use crate::error::{LoweringError, LoweringErrorKind as Kind, LoweringWarning};

type Result<T> = std::result::Result<T, LoweringError>;

/// Template parameter bindings in effect while lowering a declaration.
type TypeEnv = HashMap<String, IrType>;

/// Instances may nest this deep before lowering gives up on the chain.
const MAX_INSTANCE_DEPTH: usize = 32;

/// Output of a successful lowering: the module plus non-fatal diagnostics.
#[derive(Debug)]
pub struct Lowered {
    pub module: IrModule,
    pub warnings: Vec<LoweringWarning>,
}

/// Lowers a validated unit to IR.
///
/// Aliases are resolved away, templates are instantiated on demand and memoized
/// by their lowered arguments, capability slots become leading fields and the
/// `cast!`/`unwrap!` macros are expanded. The first error aborts the unit.
pub fn lower(unit: &Unit, unit_name: &str) -> Result<Lowered> {
    let mut lower = Lowerer::new(unit_name);
    lower.collect(unit);
    lower.lower_unit(unit)?;
    lower.check_aggregate_cycles()?;

    debug!(
        unit = unit_name,
        aggregates = lower.module.aggregates.len(),
        functions = lower.module.functions.len(),
        closures = lower.module.closures.len(),
        warnings = lower.warnings.len(),
        "lowering finished"
    );
    Ok(Lowered {
        module: lower.module,
        warnings: lower.warnings,
    })
}

/// An IR expression with its type, when the type is known. Names brought in
/// by includes have no declaration here and stay untyped.
struct Typed {
    expr: IrExpr,
    ty: Option<IrType>,
}

impl Typed {
    fn new(expr: IrExpr, ty: IrType) -> Self {
        Self { expr, ty: Some(ty) }
    }

    fn untyped(expr: IrExpr) -> Self {
        Self { expr, ty: None }
    }
}

#[derive(Clone)]
struct SigArg<'u> {
    name: String,
    ty: IrType,
    default: Option<&'u Expr>,
}

#[derive(Clone)]
struct FnSig<'u> {
    c_name: String,
    args: Vec<SigArg<'u>>,
    result: IrType,
    /// Template bindings of an instance; defaults are lowered under them.
    env: TypeEnv,
}

impl FnSig<'_> {
    /// Arguments up to and including the last one without a default.
    fn required(&self) -> usize {
        self.args
            .iter()
            .rposition(|a| a.default.is_none())
            .map_or(0, |i| i + 1)
    }
}

struct PendingInstance<'u> {
    decl: &'u FunctionDecl,
    name: String,
    env: TypeEnv,
    /// Instances that led to this one, itself last.
    chain: Vec<String>,
}

/// Per-function lowering state.
struct FnCtx {
    result: IrType,
    env: TypeEnv,
    scopes: Vec<HashMap<String, IrType>>,
    temps: usize,
    /// Statements that must run before the statement being lowered.
    hoisted: Vec<IrStmt>,
    hoist_allowed: bool,
}

impl FnCtx {
    fn new(result: IrType, env: TypeEnv) -> Self {
        Self {
            result,
            env,
            scopes: vec![HashMap::new()],
            temps: 0,
            hoisted: Vec::new(),
            hoist_allowed: true,
        }
    }

    /// Context for global initializers and enum values.
    fn constant() -> Self {
        let mut ctx = Self::new(IrType::void(), TypeEnv::new());
        ctx.hoist_allowed = false;
        ctx
    }

    fn temp(&mut self, prefix: &str) -> String {
        let n = self.temps;
        self.temps += 1;
        format!("{prefix}{n}")
    }

    fn lookup(&self, name: &str) -> Option<&IrType> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn declare(&mut self, name: &str, ty: IrType) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        let _ = self.scopes.pop();
    }

    fn flush(&mut self, out: &mut Vec<IrStmt>) {
        out.append(&mut self.hoisted);
    }
}

struct Lowerer<'u> {
    module: IrModule,
    warnings: Vec<LoweringWarning>,

    aliases: HashMap<String, &'u ctu_ast::AliasDecl>,
    alias_memo: HashMap<String, IrType>,
    alias_stack: Vec<String>,

    structs: HashMap<String, &'u StructDecl>,
    unions: HashMap<String, &'u UnionDecl>,
    enums: HashSet<String>,
    opaque: HashSet<String>,
    aggregate_kinds: HashMap<String, AggregateKind>,
    aggregate_index: HashMap<String, usize>,
    aggregate_spans: HashMap<String, Span>,

    /// Memo for struct, union and function instances keyed by base name and
    /// lowered arguments.
    instances: HashMap<(String, Vec<IrType>), String>,
    /// Instance being built and the ones that requested it, outermost first.
    instance_chain: Vec<String>,
    /// C identifiers already claimed by declarations and instances.
    taken: HashSet<String>,
    closures: HashMap<(Vec<IrType>, IrType), String>,
    closure_results: HashMap<String, IrType>,

    functions: HashMap<String, FnSig<'u>>,
    fn_templates: HashMap<String, &'u FunctionDecl>,
    pending: Vec<PendingInstance<'u>>,
    globals: HashMap<String, IrType>,
}

impl<'u> Lowerer<'u> {
    fn new(unit_name: &str) -> Self {
        Self {
            module: IrModule {
                unit: unit_name.to_string(),
                ..IrModule::default()
            },
            warnings: Vec::new(),
            aliases: HashMap::new(),
            alias_memo: HashMap::new(),
            alias_stack: Vec::new(),
            structs: HashMap::new(),
            unions: HashMap::new(),
            enums: HashSet::new(),
            opaque: HashSet::new(),
            aggregate_kinds: HashMap::new(),
            aggregate_index: HashMap::new(),
            aggregate_spans: HashMap::new(),
            instances: HashMap::new(),
            instance_chain: Vec::new(),
            taken: HashSet::new(),
            closures: HashMap::new(),
            closure_results: HashMap::new(),
            functions: HashMap::new(),
            fn_templates: HashMap::new(),
            pending: Vec::new(),
            globals: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    /// Registers every top-level declaration and reports decorators that have
    /// no meaning where they appear.
    fn collect(&mut self, unit: &'u Unit) {
        for decl in &unit.decls {
            self.claim_names(decl);
            match decl {
                Decl::Alias(a) => {
                    self.aliases.insert(a.name.node.clone(), a);
                }
                Decl::Struct(s) => {
                    self.check_decorators(&s.decorators, &["opaque"], "struct", &s.name);
                    self.structs.insert(s.name.node.clone(), s);
                    if s.params.is_empty() {
                        self.aggregate_kinds.insert(s.name.node.clone(), AggregateKind::Struct);
                        if has_decorator(&s.decorators, "opaque") {
                            self.opaque.insert(s.name.node.clone());
                        }
                    }
                }
                Decl::Union(u) => {
                    self.check_decorators(&u.decorators, &["opaque"], "union", &u.name);
                    self.unions.insert(u.name.node.clone(), u);
                    if u.params.is_empty() {
                        self.aggregate_kinds.insert(u.name.node.clone(), AggregateKind::Union);
                        if has_decorator(&u.decorators, "opaque") {
                            self.opaque.insert(u.name.node.clone());
                        }
                    }
                }
                Decl::Enum(e) => {
                    self.check_decorators(&e.decorators, &[], "enum", &e.name);
                    self.enums.insert(e.name.node.clone());
                }
                Decl::Function(f) => {
                    self.check_decorators(&f.decorators, &["inline", "internal", "static"], "function", &f.name);
                    if !f.params.is_empty() {
                        self.fn_templates.insert(f.name.node.clone(), f);
                    }
                }
                Decl::Include(_) | Decl::Global(_) => {}
            }
        }
    }

    fn claim_names(&mut self, decl: &Decl) {
        match decl {
            Decl::Alias(a) => {
                self.taken.insert(a.name.node.clone());
            }
            Decl::Struct(s) => {
                self.taken.insert(s.name.node.clone());
            }
            Decl::Union(u) => {
                self.taken.insert(u.name.node.clone());
            }
            Decl::Enum(e) => {
                self.taken.insert(e.name.node.clone());
                for m in &e.members {
                    self.taken.insert(format!("{}_{}", e.name.node, m.name.node));
                }
            }
            Decl::Function(f) => {
                self.taken.insert(f.name.node.clone());
            }
            Decl::Global(g) => {
                for binding in &g.names {
                    self.taken.insert(binding.name.node.clone());
                }
            }
            Decl::Include(_) => {}
        }
    }

    /// C name for a new instance. A mangled name that is already taken gets
    /// the first free numeric suffix.
    fn instance_name(&mut self, base: &str, args: &[IrType]) -> String {
        let mangled = mangle_instance(base, args);
        let mut name = mangled.clone();
        let mut n = 1;
        while self.taken.contains(&name) {
            name = format!("{mangled}_{n}");
            n += 1;
        }
        if name != mangled {
            debug!(instance = %mangled, renamed = %name, "instance name already in use");
        }
        self.taken.insert(name.clone());
        name
    }

    /// Fails once `next` would nest instances deeper than the limit.
    fn check_instance_depth(&self, next: &str, at: Span) -> Result<()> {
        if self.instance_chain.len() < MAX_INSTANCE_DEPTH {
            return Ok(());
        }
        let mut chain = self.instance_chain.clone();
        chain.push(next.to_string());
        Err(LoweringError::new(
            Kind::Unrepresentable,
            format!(
                "template instances nest deeper than {MAX_INSTANCE_DEPTH}: {}",
                chain.join(" -> ")
            ),
            at,
        ))
    }

    fn check_decorators(&mut self, decorators: &[Decorator], known: &[&str], what: &str, owner: &Ident) {
        for d in decorators {
            if known.contains(&d.name.node.as_str()) {
                continue;
            }
            warn!(decorator = %d.name.node, owner = %owner.node, "ignoring decorator");
            self.warnings.push(LoweringWarning::new(
                format!(
                    "decorator `@{}` has no effect on {what} `{}` and is ignored",
                    d.name.node, owner.node
                ),
                d.span,
            ));
        }
    }

    fn lower_unit(&mut self, unit: &'u Unit) -> Result<()> {
        for decl in &unit.decls {
            if let Decl::Include(inc) = decl {
                self.module.includes.push(IrInclude {
                    path: inc.path.iter().map(|s| s.node.clone()).collect(),
                });
            }
        }

        for decl in &unit.decls {
            if let Decl::Enum(e) = decl {
                self.lower_enum(e)?;
            }
        }

        for decl in &unit.decls {
            if let Decl::Alias(a) = decl {
                let ty = self.resolve_alias(&a.name.node, a.name.span)?;
                self.module.aliases.push(IrAlias {
                    name: a.name.node.clone(),
                    ty,
                });
            }
        }

        let no_env = TypeEnv::new();
        for decl in &unit.decls {
            match decl {
                Decl::Struct(s) if s.params.is_empty() => self.lower_aggregate(
                    AggregateKind::Struct,
                    &s.decorators,
                    &s.name,
                    s.name.node.clone(),
                    &s.capabilities,
                    &s.fields,
                    &no_env,
                )?,
                Decl::Union(u) if u.params.is_empty() => self.lower_aggregate(
                    AggregateKind::Union,
                    &u.decorators,
                    &u.name,
                    u.name.node.clone(),
                    &[],
                    &u.fields,
                    &no_env,
                )?,
                _ => {}
            }
        }

        // Signatures with a declared (or void) result first, so inferred
        // results can see them.
        let plain: Vec<&'u FunctionDecl> = unit
            .decls
            .iter()
            .filter_map(|d| match d {
                Decl::Function(f) if f.params.is_empty() => Some(f),
                _ => None,
            })
            .collect();
        for f in plain.iter().copied().filter(|f| !needs_inference(f)) {
            let sig = self.signature(f, f.name.node.clone(), &no_env)?;
            self.functions.insert(f.name.node.clone(), sig);
        }
        for f in plain.iter().copied().filter(|f| needs_inference(f)) {
            let sig = self.signature(f, f.name.node.clone(), &no_env)?;
            self.functions.insert(f.name.node.clone(), sig);
        }

        for decl in &unit.decls {
            if let Decl::Global(g) = decl {
                self.lower_global(g)?;
            }
        }

        for f in plain {
            let lowered = self.lower_function(f, f.name.node.clone(), &no_env)?;
            self.module.functions.push(lowered);
        }

        while let Some(inst) = self.pending.pop() {
            self.instance_chain = inst.chain;
            let lowered = self.lower_function(inst.decl, inst.name, &inst.env)?;
            self.instance_chain.clear();
            self.module.functions.push(lowered);
        }
        Ok(())
    }

    fn lower_enum(&mut self, e: &'u EnumDecl) -> Result<()> {
        let backing = match &e.backing {
            Some(ty) => Some(self.lower_type(ty, &TypeEnv::new())?),
            None => None,
        };
        let expected = backing.clone().unwrap_or(IrType::Builtin(BuiltinType::Int));
        let mut members = Vec::with_capacity(e.members.len());
        for m in &e.members {
            let value = match &m.value {
                Some(v) => {
                    let mut ctx = FnCtx::constant();
                    Some(self.lower_expr(v, Some(&expected), &mut ctx)?.expr)
                }
                None => None,
            };
            members.push((format!("{}_{}", e.name.node, m.name.node), value));
        }
        self.module.enums.push(IrEnum {
            name: e.name.node.clone(),
            backing,
            members,
        });
        Ok(())
    }

    fn resolve_alias(&mut self, name: &str, at: Span) -> Result<IrType> {
        if let Some(ty) = self.alias_memo.get(name) {
            return Ok(ty.clone());
        }
        let Some(decl) = self.aliases.get(name).copied() else {
            return Ok(IrType::Named(name.to_string()));
        };
        if let Some(start) = self.alias_stack.iter().position(|n| n == name) {
            let mut chain = self.alias_stack[start..].to_vec();
            chain.push(name.to_string());
            return Err(LoweringError::new(
                Kind::CyclicAlias,
                format!("alias `{name}` refers to itself: {}", chain.join(" -> ")),
                decl.name.span,
            ));
        }

        self.alias_stack.push(name.to_string());
        let resolved = self.lower_type(&decl.target, &TypeEnv::new());
        self.alias_stack.pop();
        let ty = resolved.map_err(|e| {
            if e.kind == Kind::CyclicAlias {
                e
            } else {
                LoweringError::new(e.kind, format!("in alias `{name}`: {}", e.message), at)
            }
        })?;
        self.alias_memo.insert(name.to_string(), ty.clone());
        Ok(ty)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_aggregate(
        &mut self,
        kind: AggregateKind,
        decorators: &[Decorator],
        name: &Ident,
        c_name: String,
        capabilities: &'u [Capability],
        fields: &'u [Field],
        env: &TypeEnv,
    ) -> Result<()> {
        let opaque = has_decorator(decorators, "opaque");
        let mut lowered = IrAggregate {
            kind,
            name: c_name.clone(),
            fields: Vec::new(),
            capabilities: Vec::new(),
            opaque,
        };

        if !opaque {
            for cap in capabilities {
                let ty = self.lower_type(&cap.base, env)?;
                let is_struct = match &ty {
                    IrType::Named(base) => {
                        self.aggregate_kinds.get(base) == Some(&AggregateKind::Struct) && !self.opaque.contains(base)
                    }
                    _ => false,
                };
                if !is_struct {
                    return Err(LoweringError::new(
                        Kind::Unrepresentable,
                        format!(
                            "capability `{}` of `{}` must name a complete struct",
                            cap.label.node, name.node
                        ),
                        cap.base.span,
                    ));
                }
                lowered.fields.push(IrField {
                    name: cap.label.node.clone(),
                    ty,
                });
                lowered.capabilities.push(cap.label.node.clone());
            }
            for field in fields {
                let ty = self.lower_type(&field.ty, env)?;
                self.require_complete(&ty, field.ty.span)?;
                lowered.fields.push(IrField {
                    name: field.name.node.clone(),
                    ty,
                });
            }
        }

        self.aggregate_index.insert(c_name.clone(), self.module.aggregates.len());
        self.aggregate_spans.insert(c_name, name.span);
        self.module.aggregates.push(lowered);
        Ok(())
    }

    fn check_aggregate_cycles(&self) -> Result<()> {
        aggregate_order(&self.module.aggregates).map(|_| ()).map_err(|cycle| {
            let first = cycle.path.first().cloned().unwrap_or_default();
            let at = self.aggregate_spans.get(&first).copied().unwrap_or_default();
            LoweringError::new(
                Kind::CyclicAggregate,
                format!("aggregates contain each other by value: {}", cycle.path.join(" -> ")),
                at,
            )
        })
    }

    fn lower_global(&mut self, g: &'u VarDecl) -> Result<()> {
        let mut ctx = FnCtx::constant();
        for (i, binding) in g.names.iter().enumerate() {
            let declared = match &binding.ty {
                Some(ty) => Some(self.lower_type(ty, &TypeEnv::new())?),
                None => None,
            };
            let init = match &g.init {
                Some(e) => Some(self.lower_expr(e, declared.as_ref(), &mut ctx)?),
                None => None,
            };
            if i == 0 && g.names.len() > 1 {
                if let Some(init) = &init {
                    if !init.expr.is_pure() {
                        return Err(shared_impure_init(g.span));
                    }
                }
            }
            let ty = declared
                .or_else(|| init.as_ref().and_then(|t| t.ty.clone()))
                .ok_or_else(|| uninferable(&binding.name))?;
            self.require_complete(&ty, binding.span)?;
            self.globals.insert(binding.name.node.clone(), ty.clone());
            self.module.globals.push(IrGlobal {
                name: binding.name.node.clone(),
                ty,
                init: init.map(|t| t.expr),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn signature(&mut self, f: &'u FunctionDecl, c_name: String, env: &TypeEnv) -> Result<FnSig<'u>> {
        let mut args = Vec::with_capacity(f.args.len());
        for arg in &f.args {
            args.push(SigArg {
                name: arg.name.node.clone(),
                ty: self.lower_type(&arg.ty, env)?,
                default: arg.default.as_ref(),
            });
        }

        let result = match (&f.result, &f.body) {
            (Some(ty), _) => self.lower_type(ty, env)?,
            (None, Some(FunctionBody::Expr(e))) => {
                let mut ctx = FnCtx::new(IrType::void(), env.clone());
                for (arg, sig) in f.args.iter().zip(&args) {
                    ctx.declare(&arg.name.node, sig.ty.clone());
                }
                self.lower_expr(e, None, &mut ctx)?.ty.ok_or_else(|| {
                    LoweringError::new(
                        Kind::UninferableType,
                        format!("cannot infer the result type of `{}`; declare it", f.name.node),
                        f.name.span,
                    )
                })?
            }
            (None, _) => IrType::void(),
        };

        Ok(FnSig {
            c_name,
            args,
            result,
            env: env.clone(),
        })
    }

    fn lower_function(&mut self, f: &'u FunctionDecl, c_name: String, env: &TypeEnv) -> Result<IrFunction> {
        let sig = match self.functions.get(&c_name) {
            Some(sig) => sig.clone(),
            None => self.signature(f, c_name.clone(), env)?,
        };

        let args: Vec<IrField> = f
            .args
            .iter()
            .zip(&sig.args)
            .map(|(arg, s)| IrField {
                name: arg.name.node.clone(),
                ty: s.ty.clone(),
            })
            .collect();

        let body = match &f.body {
            None => None,
            Some(body) => {
                let mut ctx = FnCtx::new(sig.result.clone(), env.clone());
                for arg in &args {
                    ctx.declare(&arg.name, arg.ty.clone());
                }
                let mut out = Vec::new();
                match body {
                    FunctionBody::Block(block) => {
                        for stmt in &block.stmts {
                            self.lower_stmt(stmt, &mut ctx, &mut out)?;
                        }
                    }
                    FunctionBody::Expr(e) => {
                        let expected = (!sig.result.is_void()).then(|| sig.result.clone());
                        let value = self.lower_expr(e, expected.as_ref(), &mut ctx)?;
                        ctx.flush(&mut out);
                        if sig.result.is_void() {
                            out.push(IrStmt::Expr(value.expr));
                        } else {
                            out.push(IrStmt::Return(Some(value.expr)));
                        }
                    }
                }
                Some(out)
            }
        };

        let linkage = if has_decorator(&f.decorators, "inline") {
            Linkage::Inline
        } else if has_decorator(&f.decorators, "internal") || has_decorator(&f.decorators, "static") {
            Linkage::Internal
        } else {
            Linkage::External
        };

        Ok(IrFunction {
            name: c_name,
            args,
            result: sig.result,
            body,
            linkage,
            position: f.name.span.start,
        })
    }

    fn instantiate_function(&mut self, base: &[Ident], targs: &'u [TypeExpr], env: &TypeEnv) -> Result<String> {
        let Some(head) = base.first() else {
            return Err(LoweringError::new(Kind::Unrepresentable, "empty template name", Span::default()));
        };
        let name = head.node.as_str();
        let Some(decl) = self.fn_templates.get(name).copied() else {
            return Err(LoweringError::new(
                Kind::Unrepresentable,
                format!("`{}` is not a template function", path_string(base)),
                head.span,
            ));
        };

        let mut args = Vec::with_capacity(targs.len());
        for t in targs {
            args.push(self.lower_type(t, env)?);
        }
        check_arity(name, decl.params.len(), args.len(), head.span)?;

        let key = (name.to_string(), args);
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.clone());
        }
        self.check_instance_depth(&mangle_instance(name, &key.1), head.span)?;
        let mangled = self.instance_name(name, &key.1);
        let mut chain = self.instance_chain.clone();
        chain.push(mangled.clone());
        let inst_env: TypeEnv = decl
            .params
            .iter()
            .map(|p| p.node.clone())
            .zip(key.1.iter().cloned())
            .collect();
        self.instances.insert(key, mangled.clone());
        debug!(template = name, instance = %mangled, "instantiating function");

        let sig = self.signature(decl, mangled.clone(), &inst_env)?;
        self.functions.insert(mangled.clone(), sig);
        self.pending.push(PendingInstance {
            decl,
            name: mangled.clone(),
            env: inst_env,
            chain,
        });
        Ok(mangled)
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    fn lower_type(&mut self, ty: &'u TypeExpr, env: &TypeEnv) -> Result<IrType> {
        match &ty.kind {
            TypeKind::Builtin(b) => Ok(IrType::Builtin(*b)),
            TypeKind::Pointer(inner) => Ok(IrType::Pointer(Box::new(self.lower_type(inner, env)?))),
            TypeKind::Const(inner) => Ok(IrType::Const(Box::new(self.lower_type(inner, env)?))),
            TypeKind::Array { elem, bound } => {
                let elem = self.lower_type(elem, env)?;
                let bound = match bound {
                    Some(b) => Some(array_bound(b)?),
                    None => None,
                };
                Ok(IrType::Array {
                    elem: Box::new(elem),
                    bound,
                })
            }
            TypeKind::Closure { args, result } => {
                let mut lowered = Vec::with_capacity(args.len());
                for a in args {
                    lowered.push(self.lower_type(a, env)?);
                }
                let result = self.lower_type(result, env)?;
                Ok(IrType::Named(self.closure_typedef(lowered, result)))
            }
            TypeKind::Named(path) => self.lower_named_type(path, env, ty.path_span()),
            TypeKind::Template { base, args } => {
                let mut lowered = Vec::with_capacity(args.len());
                for a in args {
                    lowered.push(self.lower_type(a, env)?);
                }
                let name = self.instantiate_aggregate(base, lowered, ty.path_span())?;
                Ok(IrType::Named(name))
            }
        }
    }

    fn lower_named_type(&mut self, path: &[Ident], env: &TypeEnv, at: Span) -> Result<IrType> {
        let [single] = path else {
            return Ok(IrType::Named(join_path(path)));
        };
        let name = single.node.as_str();
        if let Some(bound) = env.get(name) {
            return Ok(bound.clone());
        }
        if let Some(b) = BuiltinType::from_name(name) {
            return Ok(IrType::Builtin(b));
        }
        if self.aliases.contains_key(name) {
            return self.resolve_alias(name, at);
        }
        let params = self
            .structs
            .get(name)
            .map(|s| s.params.len())
            .or_else(|| self.unions.get(name).map(|u| u.params.len()))
            .unwrap_or(0);
        check_arity(name, params, 0, at)?;
        Ok(IrType::Named(name.to_string()))
    }

    fn instantiate_aggregate(&mut self, base: &[Ident], args: Vec<IrType>, at: Span) -> Result<String> {
        let name = join_path(base);
        let (kind, params) = if let Some(s) = self.structs.get(&name) {
            (AggregateKind::Struct, s.params.len())
        } else if let Some(u) = self.unions.get(&name) {
            (AggregateKind::Union, u.params.len())
        } else {
            return Err(LoweringError::new(
                Kind::Unrepresentable,
                format!("`{}` is not a template type", path_string(base)),
                at,
            ));
        };
        check_arity(&name, params, args.len(), at)?;

        let key = (name.clone(), args);
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.clone());
        }
        self.check_instance_depth(&mangle_instance(&name, &key.1), at)?;
        let mangled = self.instance_name(&name, &key.1);
        self.instances.insert(key.clone(), mangled.clone());
        self.aggregate_kinds.insert(mangled.clone(), kind);
        debug!(template = %name, instance = %mangled, "instantiating aggregate");

        self.instance_chain.push(mangled.clone());
        let built = self.build_instance(kind, &name, &mangled, &key.1);
        self.instance_chain.pop();
        built?;
        Ok(mangled)
    }

    fn build_instance(&mut self, kind: AggregateKind, name: &str, mangled: &str, args: &[IrType]) -> Result<()> {
        match kind {
            AggregateKind::Struct => {
                let Some(decl) = self.structs.get(name).copied() else {
                    return Ok(());
                };
                if has_decorator(&decl.decorators, "opaque") {
                    self.opaque.insert(mangled.to_string());
                }
                let env = bind_params(&decl.params, args);
                self.lower_aggregate(
                    kind,
                    &decl.decorators,
                    &decl.name,
                    mangled.to_string(),
                    &decl.capabilities,
                    &decl.fields,
                    &env,
                )
            }
            AggregateKind::Union => {
                let Some(decl) = self.unions.get(name).copied() else {
                    return Ok(());
                };
                if has_decorator(&decl.decorators, "opaque") {
                    self.opaque.insert(mangled.to_string());
                }
                let env = bind_params(&decl.params, args);
                self.lower_aggregate(kind, &decl.decorators, &decl.name, mangled.to_string(), &[], &decl.fields, &env)
            }
        }
    }

    /// Structurally identical closure types share one typedef.
    fn closure_typedef(&mut self, args: Vec<IrType>, result: IrType) -> String {
        let key = (args, result);
        if let Some(name) = self.closures.get(&key) {
            return name.clone();
        }
        let (args, result) = key.clone();
        let arg_part = if args.is_empty() {
            "void".to_string()
        } else {
            args.iter().map(IrType::mangle).collect::<Vec<_>>().join("_")
        };
        let name = format!("fn_{}_of_{arg_part}", result.mangle());
        self.closures.insert(key, name.clone());
        self.closure_results.insert(name.clone(), result.clone());
        self.module.closures.push(IrClosure {
            name: name.clone(),
            args,
            result,
        });
        name
    }

    fn require_complete(&self, ty: &IrType, at: Span) -> Result<()> {
        if let Some(name) = ty.embedded_name() {
            if self.opaque.contains(name) {
                return Err(LoweringError::new(
                    Kind::Unrepresentable,
                    format!("opaque type `{name}` can only be used behind a pointer"),
                    at,
                ));
            }
        }
        Ok(())
    }

    fn aggregate(&self, ty: &IrType) -> Option<&IrAggregate> {
        match ty.strip_const() {
            IrType::Named(name) => self
                .aggregate_index
                .get(name)
                .and_then(|&i| self.module.aggregates.get(i)),
            _ => None,
        }
    }

    /// Field path from an aggregate to `field`, searching direct fields first
    /// and then capability slots in declaration order.
    fn member_path(&self, agg: &IrAggregate, field: &str, seen: &mut Vec<String>) -> Option<(Vec<String>, IrType)> {
        if let Some(f) = agg.fields.iter().find(|f| f.name == field) {
            return Some((vec![f.name.clone()], f.ty.clone()));
        }
        if seen.contains(&agg.name) {
            return None;
        }
        seen.push(agg.name.clone());
        for label in &agg.capabilities {
            let Some(slot) = agg.fields.iter().find(|f| &f.name == label) else {
                continue;
            };
            let Some(inner) = self.aggregate(&slot.ty) else {
                continue;
            };
            if let Some((mut path, ty)) = self.member_path(inner, field, seen) {
                path.insert(0, label.clone());
                return Some((path, ty));
            }
        }
        None
    }

    /// Value returned by `unwrap!` when its operand is absent.
    fn absent_value(&self, result: &IrType) -> Option<IrExpr> {
        if result.is_void() {
            return None;
        }
        let value = match result.strip_const() {
            t if t.is_pointer() => IrExpr::Null,
            IrType::Named(n) if self.aggregate_index.contains_key(n) => IrExpr::ZeroInit(result.clone()),
            IrType::Named(n) if self.closure_results.contains_key(n) => IrExpr::Null,
            _ => IrExpr::int(0),
        };
        Some(value)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn lower_block(&mut self, block: &'u Block, ctx: &mut FnCtx) -> Result<Vec<IrStmt>> {
        ctx.push_scope();
        let mut out = Vec::with_capacity(block.stmts.len());
        for stmt in &block.stmts {
            self.lower_stmt(stmt, ctx, &mut out)?;
        }
        ctx.pop_scope();
        Ok(out)
    }

    fn lower_stmt(&mut self, stmt: &'u Stmt, ctx: &mut FnCtx, out: &mut Vec<IrStmt>) -> Result<()> {
        match stmt {
            Stmt::Var(var) => self.lower_var(var, ctx, out)?,
            Stmt::Expr(e) => {
                let value = self.lower_expr(e, None, ctx)?;
                ctx.flush(out);
                out.push(IrStmt::Expr(value.expr));
            }
            Stmt::Block(b) => {
                let body = self.lower_block(b, ctx)?;
                out.push(IrStmt::Block(body));
            }
            Stmt::Branch(branch) => self.lower_branch(&branch.paths, branch.else_body.as_ref(), ctx, out)?,
            Stmt::ForRange(f) => self.lower_range_loop(f, ctx, out)?,
            Stmt::ForC(f) => {
                ctx.push_scope();
                let mut pre = Vec::new();
                if let Some(init) = &f.init {
                    self.lower_stmt(init, ctx, &mut pre)?;
                }
                let cond = match &f.cond {
                    Some(c) => Some(self.lower_expr_pinned(c, None, ctx)?.expr),
                    None => None,
                };
                let step = match &f.step {
                    Some(s) => Some(self.lower_expr_pinned(s, None, ctx)?.expr),
                    None => None,
                };
                let body = self.lower_block(&f.body, ctx)?;
                ctx.pop_scope();

                let init = pre.pop().map(Box::new);
                let lowered = IrStmt::For { init, cond, step, body };
                if pre.is_empty() {
                    out.push(lowered);
                } else {
                    pre.push(lowered);
                    out.push(IrStmt::Block(pre));
                }
            }
            Stmt::While(w) => {
                let cond = self.lower_expr_pinned(&w.cond, None, ctx)?.expr;
                let body = self.lower_block(&w.body, ctx)?;
                out.push(IrStmt::While { cond, body });
            }
            Stmt::Switch(s) => {
                let scrutinee = self.lower_expr(&s.scrutinee, None, ctx)?;
                ctx.flush(out);
                let mut cases = Vec::with_capacity(s.cases.len());
                for case in &s.cases {
                    let value = self.lower_expr_pinned(&case.value, scrutinee.ty.as_ref(), ctx)?;
                    let body = self.lower_block(&case.body, ctx)?;
                    cases.push((value.expr, body));
                }
                let default = match &s.default {
                    Some(d) => Some(self.lower_block(d, ctx)?),
                    None => None,
                };
                out.push(IrStmt::Switch {
                    scrutinee: scrutinee.expr,
                    cases,
                    default,
                });
            }
            Stmt::Return(r) => {
                let value = match &r.value {
                    Some(v) => {
                        let expected = ctx.result.clone();
                        Some(self.lower_expr(v, Some(&expected), ctx)?.expr)
                    }
                    None => None,
                };
                ctx.flush(out);
                out.push(IrStmt::Return(value));
            }
            Stmt::Break(_) => out.push(IrStmt::Break),
            Stmt::Continue(_) => out.push(IrStmt::Continue),
        }
        Ok(())
    }

    fn lower_var(&mut self, var: &'u VarDecl, ctx: &mut FnCtx, out: &mut Vec<IrStmt>) -> Result<()> {
        let shared = var.names.len() > 1;
        let mut decls = Vec::with_capacity(var.names.len());
        for (i, binding) in var.names.iter().enumerate() {
            let declared = match &binding.ty {
                Some(ty) => Some(self.lower_type(ty, &ctx.env.clone())?),
                None => None,
            };
            // One initializer feeding several names is evaluated once per
            // name, so it may not hoist or have side effects.
            let init = match &var.init {
                Some(e) if shared => Some(self.lower_expr_pinned(e, declared.as_ref(), ctx)?),
                Some(e) => Some(self.lower_expr(e, declared.as_ref(), ctx)?),
                None => None,
            };
            if shared && i == 0 {
                if let Some(init) = &init {
                    if !init.expr.is_pure() {
                        return Err(shared_impure_init(var.span));
                    }
                }
            }
            let ty = declared
                .or_else(|| init.as_ref().and_then(|t| t.ty.clone()))
                .ok_or_else(|| uninferable(&binding.name))?;
            self.require_complete(&ty, binding.span)?;
            decls.push(IrStmt::Decl {
                name: binding.name.node.clone(),
                ty,
                init: init.map(|t| t.expr),
            });
        }

        // Bindings become visible only after the whole initializer.
        for (binding, decl) in var.names.iter().zip(&decls) {
            if let IrStmt::Decl { ty, .. } = decl {
                ctx.declare(&binding.name.node, ty.clone());
            }
        }
        ctx.flush(out);
        out.extend(decls);
        Ok(())
    }

    /// `else if` chains become nested ifs so each condition's hoisted
    /// statements run only when that condition is reached.
    fn lower_branch(
        &mut self,
        paths: &'u [ctu_ast::CondPath],
        else_body: Option<&'u Block>,
        ctx: &mut FnCtx,
        out: &mut Vec<IrStmt>,
    ) -> Result<()> {
        let Some((first, rest)) = paths.split_first() else {
            if let Some(body) = else_body {
                let body = self.lower_block(body, ctx)?;
                out.push(IrStmt::Block(body));
            }
            return Ok(());
        };

        let cond = self.lower_expr(&first.cond, None, ctx)?;
        ctx.flush(out);
        let then = self.lower_block(&first.body, ctx)?;
        let otherwise = if !rest.is_empty() {
            let mut nested = Vec::new();
            self.lower_branch(rest, else_body, ctx, &mut nested)?;
            Some(nested)
        } else {
            match else_body {
                Some(body) => Some(self.lower_block(body, ctx)?),
                None => None,
            }
        };
        out.push(IrStmt::If {
            cond: cond.expr,
            then,
            otherwise,
        });
        Ok(())
    }

    fn lower_range_loop(&mut self, f: &'u ctu_ast::ForRange, ctx: &mut FnCtx, out: &mut Vec<IrStmt>) -> Result<()> {
        let iterable = self.lower_expr(&f.iterable, None, ctx)?;
        ctx.flush(out);
        let unrepresentable = || {
            LoweringError::new(
                Kind::Unrepresentable,
                "range loops iterate an integer bound or a bounded array",
                f.iterable.span,
            )
        };
        let Some(iter_ty) = iterable.ty.clone() else {
            return Err(unrepresentable());
        };

        match (iter_ty.strip_const(), f.names.as_slice()) {
            (IrType::Builtin(b), [name]) if b.is_integer() => {
                let counter_ty = IrType::Builtin(*b);
                let bound = if iterable.expr.is_pure() {
                    iterable.expr
                } else {
                    let tmp = ctx.temp("range_end");
                    out.push(IrStmt::Decl {
                        name: tmp.clone(),
                        ty: counter_ty.clone(),
                        init: Some(iterable.expr),
                    });
                    IrExpr::name(tmp)
                };

                ctx.push_scope();
                ctx.declare(&name.node, counter_ty.clone());
                let body = self.lower_block(&f.body, ctx)?;
                ctx.pop_scope();

                out.push(IrStmt::For {
                    init: Some(Box::new(IrStmt::Decl {
                        name: name.node.clone(),
                        ty: counter_ty,
                        init: Some(IrExpr::int(0)),
                    })),
                    cond: Some(IrExpr::binary(BinOp::Lt, IrExpr::name(&name.node), bound)),
                    step: Some(IrExpr::binary(BinOp::AddAssign, IrExpr::name(&name.node), IrExpr::int(1))),
                    body,
                });
                Ok(())
            }
            (
                IrType::Array {
                    elem,
                    bound: Some(len),
                },
                names @ ([_] | [_, _]),
            ) => {
                if !iterable.expr.is_pure() {
                    return Err(LoweringError::new(
                        Kind::Unrepresentable,
                        "the array of a range loop must be a plain place expression",
                        f.iterable.span,
                    ));
                }
                let (index, item) = match names {
                    [index, item] => (index.node.clone(), item),
                    [item] => (ctx.temp("range_idx"), item),
                    _ => return Err(unrepresentable()),
                };
                let index_ty = IrType::Builtin(BuiltinType::USize);
                let elem_ty = (**elem).clone();
                let len = *len;

                ctx.push_scope();
                ctx.declare(&index, index_ty.clone());
                ctx.declare(&item.node, elem_ty.clone());
                let mut body = vec![IrStmt::Decl {
                    name: item.node.clone(),
                    ty: elem_ty,
                    init: Some(IrExpr::Index {
                        base: Box::new(iterable.expr),
                        index: Box::new(IrExpr::name(&index)),
                    }),
                }];
                body.extend(self.lower_block(&f.body, ctx)?);
                ctx.pop_scope();

                out.push(IrStmt::For {
                    init: Some(Box::new(IrStmt::Decl {
                        name: index.clone(),
                        ty: index_ty,
                        init: Some(IrExpr::int(0)),
                    })),
                    cond: Some(IrExpr::binary(BinOp::Lt, IrExpr::name(&index), IrExpr::int(len))),
                    step: Some(IrExpr::binary(BinOp::AddAssign, IrExpr::name(&index), IrExpr::int(1))),
                    body,
                });
                Ok(())
            }
            _ => Err(unrepresentable()),
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    /// Lowers an expression whose evaluation cannot be moved before the
    /// enclosing statement.
    fn lower_expr_pinned(&mut self, e: &'u Expr, expected: Option<&IrType>, ctx: &mut FnCtx) -> Result<Typed> {
        let saved = std::mem::replace(&mut ctx.hoist_allowed, false);
        let result = self.lower_expr(e, expected, ctx);
        ctx.hoist_allowed = saved;
        result
    }

    /// `expected` narrows integer literals; it is passed only where C would
    /// convert the value to a known type.
    fn lower_expr(&mut self, e: &'u Expr, expected: Option<&IrType>, ctx: &mut FnCtx) -> Result<Typed> {
        match &e.kind {
            ExprKind::Name(path) => self.lower_name(path, ctx),
            ExprKind::IntLit { digits, radix } => lower_int(digits, *radix, false, expected, e.span),
            ExprKind::FloatLit(text) => {
                let ty = match expected.map(IrType::strip_const) {
                    Some(IrType::Builtin(b)) if b.is_float() => IrType::Builtin(*b),
                    _ => IrType::Builtin(BuiltinType::F64),
                };
                Ok(Typed::new(IrExpr::Float(text.clone()), ty))
            }
            ExprKind::StringLit(s) => Ok(Typed::new(
                IrExpr::Str(s.clone()),
                IrType::Pointer(Box::new(IrType::Const(Box::new(IrType::Builtin(BuiltinType::Char))))),
            )),
            ExprKind::BoolLit(b) => Ok(Typed::new(IrExpr::Bool(*b), IrType::Builtin(BuiltinType::Bool))),
            ExprKind::Null => Ok(Typed::new(IrExpr::Null, IrType::Pointer(Box::new(IrType::void())))),
            ExprKind::Unary { op, operand } => self.lower_unary(*op, operand, expected, e.span, ctx),
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, ctx),
            ExprKind::Ternary { cond, then, otherwise } => {
                let cond = self.lower_expr(cond, None, ctx)?;
                let then = self.lower_expr_pinned(then, expected, ctx)?;
                let otherwise = self.lower_expr_pinned(otherwise, expected, ctx)?;
                let ty = then.ty.or(otherwise.ty);
                Ok(Typed {
                    expr: IrExpr::Ternary {
                        cond: Box::new(cond.expr),
                        then: Box::new(then.expr),
                        otherwise: Box::new(otherwise.expr),
                    },
                    ty,
                })
            }
            ExprKind::Elvis { lhs, rhs } => self.lower_elvis(lhs, rhs, expected, e.span, ctx),
            ExprKind::Call { callee, args } => self.lower_call(callee, args, e.span, ctx),
            ExprKind::Subscript { base, index } => {
                let base = self.lower_expr(base, None, ctx)?;
                let index = self.lower_expr(index, None, ctx)?;
                let ty = base.ty.as_ref().and_then(|t| pointee(t).cloned());
                Ok(Typed {
                    expr: IrExpr::Index {
                        base: Box::new(base.expr),
                        index: Box::new(index.expr),
                    },
                    ty,
                })
            }
            ExprKind::Member { base, name } => self.lower_member(base, name, false, ctx),
            ExprKind::DerefMember { base, name } => self.lower_member(base, name, true, ctx),
            ExprKind::Cast { ty, expr } => {
                let target = self.lower_type(ty, &ctx.env.clone())?;
                let inner = self.lower_expr(expr, None, ctx)?;
                Ok(Typed::new(
                    IrExpr::Cast {
                        ty: target.clone(),
                        expr: Box::new(inner.expr),
                    },
                    target,
                ))
            }
            ExprKind::Unwrap(operand) => self.lower_unwrap(operand, e.span, ctx),
            ExprKind::TemplateInst { base, args } => {
                let name = self.instantiate_function(base, args, &ctx.env.clone())?;
                Ok(Typed::untyped(IrExpr::Name(name)))
            }
        }
    }

    fn lower_name(&mut self, path: &[Ident], ctx: &FnCtx) -> Result<Typed> {
        match path {
            [single] => {
                let name = single.node.as_str();
                if let Some(ty) = ctx.lookup(name) {
                    return Ok(Typed::new(IrExpr::name(name), ty.clone()));
                }
                if let Some(ty) = self.globals.get(name) {
                    return Ok(Typed::new(IrExpr::name(name), ty.clone()));
                }
                if let Some(sig) = self.functions.get(name) {
                    return Ok(Typed::untyped(IrExpr::name(&sig.c_name)));
                }
                if let Some(decl) = self.fn_templates.get(name) {
                    check_arity(name, decl.params.len(), 0, single.span)?;
                }
                Ok(Typed::untyped(IrExpr::name(name)))
            }
            [owner, member] if self.enums.contains(&owner.node) => Ok(Typed::new(
                IrExpr::name(format!("{}_{}", owner.node, member.node)),
                IrType::Named(owner.node.clone()),
            )),
            _ => Ok(Typed::untyped(IrExpr::name(join_path(path)))),
        }
    }

    fn lower_unary(
        &mut self,
        op: UnaryOp,
        operand: &'u Expr,
        expected: Option<&IrType>,
        span: Span,
        ctx: &mut FnCtx,
    ) -> Result<Typed> {
        if let (UnaryOp::Neg, ExprKind::IntLit { digits, radix }) = (op, &operand.kind) {
            return lower_int(digits, *radix, true, expected, span);
        }
        let inner = self.lower_expr(operand, None, ctx)?;
        let ty = match op {
            UnaryOp::Not => Some(IrType::Builtin(BuiltinType::Bool)),
            UnaryOp::Deref => inner.ty.as_ref().and_then(|t| pointee(t).cloned()),
            UnaryOp::AddrOf => inner.ty.clone().map(|t| IrType::Pointer(Box::new(t))),
            UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => inner.ty.clone(),
        };
        Ok(Typed {
            expr: IrExpr::Unary {
                op,
                operand: Box::new(inner.expr),
            },
            ty,
        })
    }

    fn lower_binary(&mut self, op: BinOp, lhs: &'u Expr, rhs: &'u Expr, ctx: &mut FnCtx) -> Result<Typed> {
        let left = self.lower_expr(lhs, None, ctx)?;
        let right = if op.is_assignment() {
            self.lower_expr(rhs, left.ty.as_ref(), ctx)?
        } else if op.is_logical() {
            self.lower_expr_pinned(rhs, None, ctx)?
        } else {
            self.lower_expr(rhs, None, ctx)?
        };

        let ty = if op.is_comparison() || op.is_logical() {
            Some(IrType::Builtin(BuiltinType::Bool))
        } else if op.is_assignment() {
            left.ty.clone()
        } else {
            left.ty.clone().or(right.ty.clone())
        };
        Ok(Typed {
            expr: IrExpr::binary(op, left.expr, right.expr),
            ty,
        })
    }

    fn lower_elvis(
        &mut self,
        lhs: &'u Expr,
        rhs: &'u Expr,
        expected: Option<&IrType>,
        span: Span,
        ctx: &mut FnCtx,
    ) -> Result<Typed> {
        let left = self.lower_expr(lhs, expected, ctx)?;
        let value = if left.expr.is_pure() {
            left.expr
        } else if ctx.hoist_allowed {
            let ty = left.ty.clone().ok_or_else(|| {
                LoweringError::new(
                    Kind::UninferableType,
                    "cannot infer the type of the left operand of `?:`",
                    lhs.span,
                )
            })?;
            let tmp = ctx.temp("elvis_tmp");
            ctx.hoisted.push(IrStmt::Decl {
                name: tmp.clone(),
                ty,
                init: Some(left.expr),
            });
            IrExpr::name(tmp)
        } else {
            return Err(LoweringError::new(
                Kind::Unrepresentable,
                "the left operand of `?:` has side effects and cannot be evaluated ahead here",
                span,
            ));
        };

        let right = self.lower_expr_pinned(rhs, expected, ctx)?;
        Ok(Typed {
            expr: IrExpr::Ternary {
                cond: Box::new(value.clone()),
                then: Box::new(value),
                otherwise: Box::new(right.expr),
            },
            ty: left.ty.or(right.ty),
        })
    }

    fn lower_call(&mut self, callee: &'u Expr, args: &'u [Expr], span: Span, ctx: &mut FnCtx) -> Result<Typed> {
        let sig = match &callee.kind {
            ExprKind::Name(path) if path.len() == 1 && ctx.lookup(&path[0].node).is_none() => {
                self.functions.get(&path[0].node).cloned()
            }
            ExprKind::TemplateInst { base, args: targs } => {
                let name = self.instantiate_function(base, targs, &ctx.env.clone())?;
                match self.functions.get(&name) {
                    Some(sig) => Some(sig.clone()),
                    // Still inferring this instance's own result.
                    None => {
                        let mut lowered = Vec::with_capacity(args.len());
                        for a in args {
                            lowered.push(self.lower_expr(a, None, ctx)?.expr);
                        }
                        return Ok(Typed::untyped(IrExpr::Call {
                            callee: Box::new(IrExpr::name(name)),
                            args: lowered,
                        }));
                    }
                }
            }
            _ => None,
        };

        let Some(sig) = sig else {
            let callee = self.lower_expr(callee, None, ctx)?;
            let mut lowered = Vec::with_capacity(args.len());
            for a in args {
                lowered.push(self.lower_expr(a, None, ctx)?.expr);
            }
            let ty = match callee.ty.as_ref().map(IrType::strip_const) {
                Some(IrType::Named(n)) => self.closure_results.get(n).cloned(),
                _ => None,
            };
            return Ok(Typed {
                expr: IrExpr::Call {
                    callee: Box::new(callee.expr),
                    args: lowered,
                },
                ty,
            });
        };

        let required = sig.required();
        if args.len() < required || args.len() > sig.args.len() {
            let expected = if required == sig.args.len() {
                format!("{required}")
            } else {
                format!("{required} to {}", sig.args.len())
            };
            return Err(LoweringError::new(
                Kind::ArgumentCount,
                format!("`{}` takes {expected} arguments, got {}", sig.c_name, args.len()),
                span,
            ));
        }

        let mut lowered = Vec::with_capacity(sig.args.len());
        for (i, param) in sig.args.iter().enumerate() {
            let value = match (args.get(i), param.default) {
                (Some(a), _) => self.lower_expr(a, Some(&param.ty), ctx)?.expr,
                (None, Some(default)) => self.lower_default(&sig, i, default, &mut lowered, span, ctx)?,
                (None, None) => break,
            };
            lowered.push(value);
        }
        Ok(Typed::new(
            IrExpr::Call {
                callee: Box::new(IrExpr::name(&sig.c_name)),
                args: lowered,
            },
            sig.result,
        ))
    }

    /// Lowers the default of argument `index` as the callee sees it: earlier
    /// parameters stand for the arguments already in `lowered`, and any other
    /// name must not be shadowed at the call site.
    fn lower_default(
        &mut self,
        sig: &FnSig<'u>,
        index: usize,
        default: &'u Expr,
        lowered: &mut [IrExpr],
        span: Span,
        ctx: &mut FnCtx,
    ) -> Result<IrExpr> {
        let param = &sig.args[index];
        let mut callee_ctx = FnCtx::new(sig.result.clone(), sig.env.clone());
        callee_ctx.hoist_allowed = false;
        for earlier in &sig.args[..index] {
            callee_ctx.declare(&earlier.name, earlier.ty.clone());
        }
        let value = self.lower_expr(default, Some(&param.ty), &mut callee_ctx)?.expr;

        let mut used = Vec::new();
        value.for_each_name(&mut |n: &str| {
            if !used.iter().any(|u: &String| u.as_str() == n) {
                used.push(n.to_string());
            }
        });

        let mut bound: HashMap<String, IrExpr> = HashMap::new();
        for name in used {
            let Some(j) = sig.args[..index].iter().position(|a| a.name == name) else {
                if ctx.lookup(&name).is_some() {
                    return Err(LoweringError::new(
                        Kind::Unrepresentable,
                        format!(
                            "the default of `{}` in `{}` refers to `{name}`, which is shadowed at this call",
                            param.name, sig.c_name
                        ),
                        span,
                    ));
                }
                continue;
            };
            if !lowered[j].is_pure() {
                if !ctx.hoist_allowed {
                    return Err(LoweringError::new(
                        Kind::Unrepresentable,
                        format!(
                            "the default of `{}` in `{}` reuses argument `{name}`, which has side effects and \
                             cannot be evaluated ahead here",
                            param.name, sig.c_name
                        ),
                        span,
                    ));
                }
                let tmp = ctx.temp("arg_tmp");
                let init = std::mem::replace(&mut lowered[j], IrExpr::name(&tmp));
                ctx.hoisted.push(IrStmt::Decl {
                    name: tmp,
                    ty: sig.args[j].ty.clone(),
                    init: Some(init),
                });
            }
            bound.insert(name, lowered[j].clone());
        }

        Ok(value.replace_names(&|n: &str| bound.get(n).cloned()))
    }

    fn lower_member(&mut self, base: &'u Expr, name: &Ident, deref: bool, ctx: &mut FnCtx) -> Result<Typed> {
        let base = self.lower_expr(base, None, ctx)?;
        let holder = match (&base.ty, deref) {
            (Some(t), false) => Some(t.clone()),
            (Some(t), true) => pointee(t).cloned(),
            (None, _) => None,
        };
        let first = |expr: IrExpr, field: String| {
            if deref {
                IrExpr::Arrow {
                    base: Box::new(expr),
                    field,
                }
            } else {
                IrExpr::member(expr, field)
            }
        };

        let Some(agg) = holder.as_ref().and_then(|t| self.aggregate(t)) else {
            return Ok(Typed::untyped(first(base.expr, name.node.clone())));
        };
        let Some((path, ty)) = self.member_path(agg, &name.node, &mut Vec::new()) else {
            return Err(LoweringError::new(
                Kind::UnknownMember,
                format!("`{}` has no member `{}`", agg.name, name.node),
                name.span,
            ));
        };

        let mut steps = path.into_iter();
        let mut expr = base.expr;
        if let Some(head) = steps.next() {
            expr = first(expr, head);
        }
        for step in steps {
            expr = IrExpr::member(expr, step);
        }
        Ok(Typed::new(expr, ty))
    }

    /// `unwrap! e` binds `e` to a temporary before the enclosing statement and
    /// returns early when it is absent. A pointer is absent when `NULL`; a
    /// struct with `is_some` and `value` fields is absent when `!is_some` and
    /// unwraps to `value`.
    fn lower_unwrap(&mut self, operand: &'u Expr, span: Span, ctx: &mut FnCtx) -> Result<Typed> {
        if !ctx.hoist_allowed {
            return Err(LoweringError::new(
                Kind::Unrepresentable,
                "`unwrap!` cannot be expanded here: its operand must be evaluated before the enclosing statement",
                span,
            ));
        }
        let inner = self.lower_expr(operand, None, ctx)?;
        let ty = inner.ty.ok_or_else(|| {
            LoweringError::new(
                Kind::UninferableType,
                "cannot infer the type of the `unwrap!` operand",
                operand.span,
            )
        })?;

        let tmp = ctx.temp("unwrap_tmp");
        let (absent, value, value_ty) = if ty.is_pointer() {
            (
                IrExpr::binary(BinOp::Eq, IrExpr::name(&tmp), IrExpr::Null),
                IrExpr::name(&tmp),
                ty.clone(),
            )
        } else {
            let fields = self.aggregate(&ty).map(|a| {
                (
                    a.fields.iter().find(|f| f.name == "is_some").map(|f| f.ty.clone()),
                    a.fields.iter().find(|f| f.name == "value").map(|f| f.ty.clone()),
                )
            });
            let Some((Some(_), Some(value_ty))) = fields else {
                return Err(LoweringError::new(
                    Kind::Unrepresentable,
                    format!(
                        "`unwrap!` needs a pointer or a struct with `is_some` and `value` fields, not `{}`",
                        ty.mangle()
                    ),
                    operand.span,
                ));
            };
            (
                IrExpr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(IrExpr::member(IrExpr::name(&tmp), "is_some")),
                },
                IrExpr::member(IrExpr::name(&tmp), "value"),
                value_ty,
            )
        };

        let early = IrStmt::Return(self.absent_value(&ctx.result));
        ctx.hoisted.push(IrStmt::Decl {
            name: tmp,
            ty,
            init: Some(inner.expr),
        });
        ctx.hoisted.push(IrStmt::If {
            cond: absent,
            then: vec![early],
            otherwise: None,
        });
        Ok(Typed::new(value, value_ty))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_decorator(decorators: &[Decorator], name: &str) -> bool {
    decorators.iter().any(|d| d.name.node == name)
}

fn needs_inference(f: &FunctionDecl) -> bool {
    f.result.is_none() && matches!(f.body, Some(FunctionBody::Expr(_)))
}

fn join_path(path: &[Ident]) -> String {
    path.iter().map(|s| s.node.as_str()).collect::<Vec<_>>().join("_")
}

fn mangle_instance(base: &str, args: &[IrType]) -> String {
    let mut name = base.to_string();
    for a in args {
        name.push('_');
        name.push_str(&a.mangle());
    }
    name
}

fn bind_params(params: &[Ident], args: &[IrType]) -> TypeEnv {
    params.iter().map(|p| p.node.clone()).zip(args.iter().cloned()).collect()
}

fn check_arity(name: &str, expected: usize, got: usize, at: Span) -> Result<()> {
    if expected == got {
        return Ok(());
    }
    Err(LoweringError::new(
        Kind::TemplateArity,
        format!("`{name}` expects {expected} type arguments, got {got}"),
        at,
    ))
}

fn pointee(ty: &IrType) -> Option<&IrType> {
    match ty.strip_const() {
        IrType::Pointer(inner) => Some(inner),
        IrType::Array { elem, .. } => Some(elem),
        _ => None,
    }
}

fn uninferable(name: &Ident) -> LoweringError {
    LoweringError::new(
        Kind::UninferableType,
        format!("cannot infer the type of `{}`; add a type annotation", name.node),
        name.span,
    )
}

fn shared_impure_init(at: Span) -> LoweringError {
    LoweringError::new(
        Kind::Unrepresentable,
        "an initializer shared by several names must be free of side effects",
        at,
    )
}

/// Narrows an integer literal to the expected builtin, or to the first of
/// `i32`, `i64`, `u64` that holds it.
fn lower_int(digits: &str, radix: u32, negative: bool, expected: Option<&IrType>, at: Span) -> Result<Typed> {
    let sign = if negative { "-" } else { "" };
    let too_large = || {
        LoweringError::new(
            Kind::IntegerOutOfRange,
            format!("integer literal `{sign}{digits}` (base {radix}) does not fit in 64 bits"),
            at,
        )
    };
    let value = u128::from_str_radix(digits, radix).map_err(|_| too_large())?;
    if value > u64::MAX as u128 {
        return Err(too_large());
    }
    let signed = if negative { -(value as i128) } else { value as i128 };

    let target = match expected.map(IrType::strip_const) {
        Some(IrType::Builtin(b)) if b.int_range().is_some() => *b,
        _ => [BuiltinType::I32, BuiltinType::I64, BuiltinType::U64]
            .into_iter()
            .find(|b| fits(*b, signed))
            .ok_or_else(too_large)?,
    };
    if !fits(target, signed) {
        return Err(LoweringError::new(
            Kind::IntegerOutOfRange,
            format!("integer literal `{signed}` does not fit in `{}`", target.name()),
            at,
        ));
    }

    Ok(Typed::new(
        IrExpr::Int(IrInt {
            magnitude: value as u64,
            negative: negative && value != 0,
        }),
        IrType::Builtin(target),
    ))
}

fn fits(b: BuiltinType, value: i128) -> bool {
    b.int_range().is_some_and(|(min, max)| min <= value && value <= max)
}

fn array_bound(bound: &Expr) -> Result<u64> {
    const_eval(bound)
        .and_then(|v| u64::try_from(v).ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| {
            LoweringError::new(
                Kind::Unrepresentable,
                "array bound must be a positive constant integer expression",
                bound.span,
            )
        })
}

fn const_eval(e: &Expr) -> Option<i128> {
    match &e.kind {
        ExprKind::IntLit { digits, radix } => i128::from_str_radix(digits, *radix).ok(),
        ExprKind::Unary { op, operand } => {
            let v = const_eval(operand)?;
            match op {
                UnaryOp::Neg => v.checked_neg(),
                UnaryOp::Plus => Some(v),
                UnaryOp::BitNot => Some(!v),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let (a, b) = (const_eval(lhs)?, const_eval(rhs)?);
            match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => a.checked_div(b),
                BinOp::Rem => a.checked_rem(b),
                BinOp::Shl => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
                BinOp::Shr => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)),
                BinOp::BitAnd => Some(a & b),
                BinOp::BitOr => Some(a | b),
                BinOp::BitXor => Some(a ^ b),
                _ => None,
            }
        }
        ExprKind::Cast { expr, .. } => const_eval(expr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::default()
    }

    #[test]
    fn literals_default_to_the_narrowest_of_i32_i64_u64() {
        let t = lower_int("2147483647", 10, false, None, span()).unwrap();
        assert_eq!(t.ty, Some(IrType::Builtin(BuiltinType::I32)));
        let t = lower_int("2147483648", 10, false, None, span()).unwrap();
        assert_eq!(t.ty, Some(IrType::Builtin(BuiltinType::I64)));
        let t = lower_int("ffffffffffffffff", 16, false, None, span()).unwrap();
        assert_eq!(t.ty, Some(IrType::Builtin(BuiltinType::U64)));
        let err = lower_int("10000000000000000", 16, false, None, span()).err().unwrap();
        assert_eq!(err.kind, Kind::IntegerOutOfRange);
    }

    #[test]
    fn expected_type_bounds_the_literal() {
        let u8_ty = IrType::Builtin(BuiltinType::U8);
        assert!(lower_int("255", 10, false, Some(&u8_ty), span()).is_ok());
        let err = lower_int("256", 10, false, Some(&u8_ty), span()).err().unwrap();
        assert_eq!(err.kind, Kind::IntegerOutOfRange);

        let i8_ty = IrType::Builtin(BuiltinType::I8);
        let t = lower_int("128", 10, true, Some(&i8_ty), span()).unwrap();
        assert_eq!(
            t.expr,
            IrExpr::Int(IrInt {
                magnitude: 128,
                negative: true
            })
        );
    }

    #[test]
    fn min_i64_is_representable() {
        let t = lower_int("9223372036854775808", 10, true, None, span()).unwrap();
        assert_eq!(t.ty, Some(IrType::Builtin(BuiltinType::I64)));
    }

    #[test]
    fn sig_required_counts_through_last_non_default() {
        let sig = FnSig {
            c_name: "f".into(),
            args: vec![
                SigArg {
                    name: "a".into(),
                    ty: IrType::void(),
                    default: None,
                },
                SigArg {
                    name: "b".into(),
                    ty: IrType::void(),
                    default: None,
                },
            ],
            result: IrType::void(),
            env: TypeEnv::new(),
        };
        assert_eq!(sig.required(), 2);
    }
}
