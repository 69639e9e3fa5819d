use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline stage.
///
/// Generates `ID`/`MODULE`/`PHASE` constants plus `plan` and `exec`
/// associated functions. The annotated struct is the stage's own config
/// (deserialized from `config_path`, default `<module>.steps.<step>`) and
/// must provide `enabled`, `label` and a `run(&Self, &ConfigDoc, &mut ExecCtx)`
/// function.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Stage(attr: TokenStream, item: TokenStream) -> TokenStream {
    match stage_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Groups stages into a planner module. `detect` names the config table that
/// enables the module (default: the module id); `"*"` plans it unconditionally.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
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

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn expr_type(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Stage" && ident != "Module"
        })
        .cloned()
        .collect()
}

// A `when` entry is a boolean config path, optionally negated with a leading '!'.
// Missing values read as false.
struct WhenCond {
    path: String,
    expect: bool,
}

fn parse_when(raw: &str, span: proc_macro2::Span) -> syn::Result<WhenCond> {
    let raw = raw.trim();
    let (path, expect) = match raw.strip_prefix('!') {
        Some(rest) => (rest.trim(), false),
        None => (raw, true),
    };
    if path.is_empty() {
        return Err(syn::Error::new(span, "when entry must name a config path"));
    }
    Ok(WhenCond {
        path: path.to_string(),
        expect,
    })
}

struct StageMeta {
    id: String,
    module: String,
    phase: String,
    config_ty: syn::Type,
    config_path: String,
    provides: Vec<String>,
    after: Vec<String>,
    when: Vec<WhenCond>,
    default_label: String,
    core: bool,
}

fn parse_stage_meta(attr: TokenStream, struct_ident: &syn::Ident) -> syn::Result<StageMeta> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut when: Vec<WhenCond> = Vec::new();
    let mut default_label: Option<String> = None;
    let mut core = false;

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
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "config" => config_ty = Some(expr_type(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "provides" => provides = expr_array_strings(v)?,
            "after" => after = expr_array_strings(v)?,
            "when" => {
                for raw in expr_array_strings(v)? {
                    when.push(parse_when(&raw, v.span())?);
                }
            }
            "default_label" => default_label = Some(lit_str(v)?),
            "core" => core = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Stage attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing id"))?;
    let module =
        module.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing module"))?;
    let phase =
        phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing phase"))?;

    let config_path = match config_path {
        Some(p) => p,
        None => {
            if !id.starts_with(&format!("{module}.")) {
                return Err(syn::Error::new(
                    struct_ident.span(),
                    "Stage: config_path omitted but id does not start with '<module>.'",
                ));
            }
            let step = id
                .rsplit('.')
                .next()
                .ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: invalid id"))?;
            format!("{module}.steps.{step}")
        }
    };

    Ok(StageMeta {
        id,
        module,
        phase,
        config_ty: config_ty.unwrap_or_else(|| parse_quote!(#struct_ident)),
        config_path,
        provides,
        after,
        when,
        default_label: default_label
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing default_label"))?,
        core,
    })
}

fn stage_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let meta = parse_stage_meta(attr, &struct_ident)?;

    let StageMeta {
        id,
        module,
        phase,
        config_ty,
        config_path,
        provides,
        after,
        when,
        default_label,
        core,
    } = meta;

    let when_checks = when.iter().map(|w| {
        let path = &w.path;
        let expect = w.expect;
        quote! {
            if doc.value_path(#path).and_then(|v| v.as_bool()).unwrap_or(false) != #expect {
                return Ok(());
            }
        }
    });

    let enabled_check = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::config(format!(
                    "[{}].enabled=false is not allowed (required stage)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const CORE: bool = #core;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #enabled_check
                #(#when_checks)*

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })?;
                Ok(())
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #enabled_check

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }

                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

struct ModuleMeta {
    id: String,
    detect: String,
    config_ty: syn::Type,
    config_path: String,
    stages: Vec<syn::Path>,
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut detect: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut stages: Option<Vec<syn::Path>> = None;

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
            "detect" => detect = Some(lit_str(v)?),
            "config" => config_ty = Some(expr_type(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "stages" => stages = Some(expr_array_paths(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let meta = ModuleMeta {
        detect: detect.unwrap_or_else(|| id.clone()),
        id,
        config_ty: config_ty
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config"))?,
        config_path: config_path
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config_path"))?,
        stages: stages
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing stages"))?,
    };

    let id_lit = meta.id;
    let detect_lit = meta.detect;
    let config_ty = meta.config_ty;
    let config_path_lit = meta.config_path;
    let stages = meta.stages;

    // "*" plans the module for every config.
    let detect_body = if detect_lit == "*" {
        quote! { let _ = doc; true }
    } else {
        quote! { doc.has_table_path(#detect_lit) }
    };
    let plan_stages = stages.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_stages = stages.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id_lit
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                #detect_body
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path_lit)?
                    .unwrap_or_default();
                if !cfg.enabled {
                    return Ok(());
                }

                #(#plan_stages)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_stages)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
