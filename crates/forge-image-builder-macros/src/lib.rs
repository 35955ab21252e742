use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Turn a unit struct into a pipeline operation.
///
/// ```ignore
/// #[Operation(
///     id = "pipeline.link",
///     phase = "link",
///     after = ["pipeline.build?"],
///     default_label = "Link components"
/// )]
/// pub struct LinkOp;
///
/// impl LinkOp {
///     fn run(pipeline: &Pipeline<'_>, ctx: &mut ExecCtx) -> Result<()> { ... }
/// }
/// ```
///
/// Generates `ID`/`PHASE`/`LABEL` constants, `plan` (adds the task to a
/// `Plan` once), `register` (adds `exec` to a `TaskRegistry`) and `exec`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Operation(attr: TokenStream, item: TokenStream) -> TokenStream {
    match operation_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            !p.is_ident("Operation")
        })
        .cloned()
        .collect()
}

struct OperationMeta {
    id: String,
    phase: String,
    after: Vec<String>,
    default_label: String,
}

fn parse_meta(attr: TokenStream, st: &ItemStruct) -> syn::Result<OperationMeta> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "after" => after = expr_array_strings(v)?,
            "default_label" => default_label = Some(lit_str(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Operation attribute key '{other}'"),
                ));
            }
        }
    }

    let span = st.ident.span();
    let id = id.ok_or_else(|| syn::Error::new(span, "Operation: missing id"))?;
    if !id.starts_with("pipeline.") {
        return Err(syn::Error::new(
            span,
            "Operation: id must start with 'pipeline.'",
        ));
    }
    Ok(OperationMeta {
        id,
        phase: phase.ok_or_else(|| syn::Error::new(span, "Operation: missing phase"))?,
        after,
        default_label: default_label
            .ok_or_else(|| syn::Error::new(span, "Operation: missing default_label"))?,
    })
}

fn operation_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let meta = parse_meta(attr, &st)?;

    let id_lit = meta.id;
    let phase_lit = meta.phase;
    let label_lit = meta.default_label;
    let after_lits = meta.after;

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id_lit;
            pub const PHASE: &'static str = #phase_lit;
            pub const LABEL: &'static str = #label_lit;

            pub fn plan(plan: &mut crate::planner::Plan) -> crate::Result<()> {
                if plan.get(Self::ID).is_some() {
                    return Ok(());
                }
                plan.add(crate::planner::Task {
                    id: Self::ID.to_string(),
                    label: Self::LABEL.to_string(),
                    phase: Self::PHASE.to_string(),
                    after: vec![#(#after_lits.to_string()),*],
                })
            }

            pub fn register(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                reg.add(Self::ID, Self::exec)
            }

            // Operations define their behavior by implementing:
            // `fn run(pipeline: &crate::pipeline::Pipeline<'_>, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()>`
            pub fn exec(
                pipeline: &crate::pipeline::Pipeline<'_>,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                ::tracing::info!(operation = Self::ID, "{}", Self::LABEL);
                Self::run(pipeline, ctx)
            }
        }
    };

    Ok(expanded.into())
}
