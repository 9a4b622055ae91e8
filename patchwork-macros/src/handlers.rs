//! Implementations for the stage procedural macros
//!
//! This module transforms plain functions into unit structs that
//! implement the `PreStage` or `PostStage` trait.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{Error, FnArg, ItemFn, ReturnType, Type, parse_macro_input};

/// Which stage trait to implement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
	Pre,
	Post,
}

/// Transform a function into a stage struct
///
/// The output contains:
/// 1. A unit struct with the function's name in CamelCase
/// 2. An implementation of the stage trait for that struct
/// 3. The original function, called by the stage
pub fn handle_stage(kind: StageKind, attr: TokenStream, item: TokenStream) -> TokenStream {
	let attr = TokenStream2::from(attr);
	if !attr.is_empty() {
		return Error::new(attr.span(), "stage attributes take no arguments")
			.to_compile_error()
			.into();
	}

	let input_fn = parse_macro_input!(item as ItemFn);

	match expand(kind, &input_fn) {
		Ok(output) => output.into(),
		Err(err) => err.to_compile_error().into(),
	}
}

fn expand(kind: StageKind, input_fn: &ItemFn) -> syn::Result<TokenStream2> {
	validate_signature(kind, input_fn)?;

	let fn_name = &input_fn.sig.ident;
	let fn_vis = &input_fn.vis;
	let struct_ident = format_ident!("{}", fn_name_to_struct_name(&fn_name.to_string()));
	let doc = format!("Stage generated from [`{fn_name}`]");

	let stage_impl = match kind {
		StageKind::Pre => quote! {
			impl ::patchwork_rs::PreStage for #struct_ident {
				fn before(&self, ctx: &mut ::patchwork_rs::CallContext) -> ::patchwork_rs::Flow {
					#fn_name(ctx)
				}

				fn name(&self) -> &'static str {
					stringify!(#fn_name)
				}
			}
		},
		StageKind::Post => quote! {
			impl ::patchwork_rs::PostStage for #struct_ident {
				fn after(&self, ctx: &mut ::patchwork_rs::CallContext) {
					#fn_name(ctx)
				}

				fn name(&self) -> &'static str {
					stringify!(#fn_name)
				}
			}
		},
	};

	Ok(quote! {
		#[doc = #doc]
		#[derive(Debug, Clone, Copy, Default)]
		#fn_vis struct #struct_ident;

		#stage_impl

		#input_fn
	})
}

/// Convert a snake_case function name to a CamelCase struct name
fn fn_name_to_struct_name(name: &str) -> String {
	let mut result = String::new();
	for part in name.split('_') {
		let mut chars = part.chars();
		if let Some(first) = chars.next() {
			result.extend(first.to_uppercase());
			result.push_str(chars.as_str());
		}
	}
	result
}

/// Check the function has the shape the stage trait calls
///
/// Both kinds take exactly one `&mut CallContext` argument. A pre-stage
/// returns `Flow`, a post-stage returns nothing.
fn validate_signature(kind: StageKind, input_fn: &ItemFn) -> syn::Result<()> {
	let sig = &input_fn.sig;

	if !sig.generics.params.is_empty() {
		return Err(Error::new(sig.generics.span(), "stage functions cannot be generic"));
	}
	if sig.asyncness.is_some() {
		return Err(Error::new(sig.asyncness.span(), "stage functions cannot be async"));
	}

	match (kind, &sig.output) {
		(StageKind::Pre, ReturnType::Default) => {
			return Err(Error::new(sig.span(), "pre-stage must return Flow"));
		},
		(StageKind::Pre, ReturnType::Type(_, ty)) => {
			let ty_str = quote!(#ty).to_string();
			if !ty_str.ends_with("Flow") {
				return Err(Error::new(ty.span(), format!("pre-stage must return Flow, got {ty_str}")));
			}
		},
		(StageKind::Post, ReturnType::Type(_, ty)) => {
			let is_unit = matches!(&**ty, Type::Tuple(tuple) if tuple.elems.is_empty());
			if !is_unit {
				return Err(Error::new(ty.span(), "post-stage must not return a value"));
			}
		},
		(StageKind::Post, ReturnType::Default) => {},
	}

	let mut inputs = sig.inputs.iter();
	let (Some(arg), None) = (inputs.next(), inputs.next()) else {
		return Err(Error::new(
			sig.inputs.span(),
			"stage must take exactly one argument: &mut CallContext",
		));
	};

	match arg {
		FnArg::Receiver(receiver) => Err(Error::new(receiver.span(), "stage cannot be a method")),
		FnArg::Typed(pat_type) => match &*pat_type.ty {
			Type::Reference(reference) if reference.mutability.is_some() => {
				let inner = &reference.elem;
				let ty_str = quote!(#inner).to_string();
				if ty_str.ends_with("CallContext") {
					Ok(())
				} else {
					Err(Error::new(
						pat_type.ty.span(),
						format!("stage argument must be &mut CallContext, got &mut {ty_str}"),
					))
				}
			},
			other => Err(Error::new(other.span(), "stage argument must be &mut CallContext")),
		},
	}
}
