extern crate proc_macro;

use proc_macro::TokenStream;

mod handlers;

use handlers::{StageKind, handle_stage};

/// Define a pre-stage function
///
/// This macro turns `fn name(ctx: &mut CallContext) -> Flow` into a unit
/// struct `Name` implementing the `PreStage` trait. The function itself is
/// kept and called by the stage.
///
/// # Example
///
/// ```ignore
/// use patchwork_rs::{CallContext, Flow};
///
/// #[patchwork_rs::pre_stage]
/// fn mute_volume(ctx: &mut CallContext) -> Flow {
///     Flow::Return(0.0.into())
/// }
///
/// let unit = PatchUnit::builder("mute", target).pre(MuteVolume).build();
/// ```
#[proc_macro_attribute]
pub fn pre_stage(attr: TokenStream, item: TokenStream) -> TokenStream {
	handle_stage(StageKind::Pre, attr, item)
}

/// Define a post-stage function
///
/// This macro turns `fn name(ctx: &mut CallContext)` into a unit struct
/// `Name` implementing the `PostStage` trait.
#[proc_macro_attribute]
pub fn post_stage(attr: TokenStream, item: TokenStream) -> TokenStream {
	handle_stage(StageKind::Post, attr, item)
}
