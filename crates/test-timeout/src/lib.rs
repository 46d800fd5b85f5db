//! `#[tokio_timeout_test]`: an async test on its own runtime and thread,
//! failed with "test timed out" once its deadline passes instead of hanging
//! the whole test binary.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_deadline() {}
//!
//! #[test_timeout::tokio_timeout_test(30, multi_thread)]
//! async fn thirty_seconds_on_a_worker_pool() {}
//! ```
//!
//! `TEST_TIMEOUT_SECS` in the environment replaces every deadline, which is
//! useful on slow CI machines.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                args.secs = lit.base10_parse()?;
                if args.secs == 0 {
                    return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
                }
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "multi_thread" => args.multi_thread = true,
                    "current_thread" => args.multi_thread = false,
                    other => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!("unknown option `{other}`; expected seconds, `multi_thread` or `current_thread`"),
                        ));
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    if !sig.inputs.is_empty() {
        return syn::Error::new_spanned(&sig.inputs, "test functions take no arguments")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let secs = args.secs;
    let builder = if args.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread() }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let test_name = sig.ident.to_string();
    let thread_name = syn::LitStr::new(&test_name, Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::env::var("TEST_TIMEOUT_SECS")
                .ok()
                .and_then(|secs| secs.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(std::time::Duration::from_secs)
                .unwrap_or(std::time::Duration::from_secs(#secs));
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#thread_name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = #builder
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            tokio::time::timeout(timeout_duration, async move #block)
                                .await
                                .expect("test timed out");
                        });
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            // The in-runtime timeout only fires if the test yields; this one
            // also catches a test blocking its thread.
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the test is not registered twice.
fn is_test_attribute(attr: &Attribute) -> bool {
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
