//! Deadline-bounded test attributes.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, `#[test_timeout::tokio_timeout_test]`
//! wraps an async one in a fresh current-thread runtime. Both accept an optional deadline in
//! seconds (`#[test_timeout::timeout(5)]`, default 60) and run the body on a helper thread so a
//! hung test fails instead of stalling the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr.into(), item, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(attr.into(), item, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream2, item: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let timeout_secs = parse_timeout(attr)?;

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Sync, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous test; use tokio_timeout_test for async tests",
            ))
        }
        (Flavor::Tokio, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test can only be applied to async functions",
            ))
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = match flavor {
        Flavor::Sync => quote! { #block },
        Flavor::Tokio => quote! {
            {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            }
        },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are emitted by the expansion itself.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
