use proc_macro::TokenStream;
use quote::quote;
use syn::{parse::Parser, parse_quote, punctuated::Punctuated, Expr, ItemFn, Token};

/// Wraps a function returning `crate::Result<_>` so that any error it returns
/// gets a context message pushed onto its stack, tagged with the caller's
/// location. Accepts either a single expression or `format!`-style arguments.
#[proc_macro_attribute]
pub fn error_context(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = match syn::parse::<ItemFn>(item) {
        Ok(function) => function,
        Err(err) => return err.to_compile_error().into(),
    };

    let message: Expr = if args.len() == 1 {
        let only = &args[0];
        parse_quote!(#only)
    } else {
        let args = args.iter();
        parse_quote!(format!(#(#args),*))
    };

    let body = function.block;
    function.attrs.push(parse_quote!(#[track_caller]));
    function.block = Box::new(parse_quote!({
        let __rgrekey_caller = std::panic::Location::caller();
        let __rgrekey_result: crate::Result<_> = (|| #body)();
        __rgrekey_result
            .map_err(|__rgrekey_err| __rgrekey_err.context_at(#message, __rgrekey_caller))
    }));

    TokenStream::from(quote!(#function))
}
