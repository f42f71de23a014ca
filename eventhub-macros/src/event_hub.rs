use crate::attrs::{EventHubAttrConfig, MethodAttr, MethodKind, parse_method_attr};
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    FnArg, Ident, ImplItem, ImplItemFn, ItemImpl, LitStr, Result as SynResult, ReturnType, Type,
    Visibility, parse_quote, spanned::Spanned,
};

pub(crate) fn expand(cfg: EventHubAttrConfig, mut imp: ItemImpl) -> SynResult<TokenStream2> {
    if let Some((_, path, _)) = &imp.trait_ {
        return Err(syn::Error::new(
            path.span(),
            "#[event_hub] must be placed on an inherent impl block",
        ));
    }

    let service_name = match cfg.name {
        Some(lit) => lit,
        None => default_service_name(&imp.self_ty)?,
    };
    let slots_field = cfg
        .publishers
        .unwrap_or_else(|| format_ident!("publishers"));

    let mut items = Vec::with_capacity(imp.items.len());
    let mut publish_entries = Vec::new();
    let mut subscribe_entries = Vec::new();

    for item in std::mem::take(&mut imp.items) {
        let ImplItem::Fn(mut f) = item else {
            items.push(item);
            continue;
        };

        let (publish, subscribe) = take_method_attrs(&mut f)?;

        if let Some(attr) = &subscribe {
            subscribe_entries.push(subscriber_entry(&f, attr)?);
        }

        match publish {
            Some(attr) => {
                let name = LitStr::new(&f.sig.ident.to_string(), f.sig.ident.span());
                let options = options_tokens(&attr);
                publish_entries.push(quote! {
                    .publish(#name, #options, self.#slots_field.slot(#name))
                });

                let (inner, outer) = split_publisher(f, &slots_field)?;
                items.push(ImplItem::Fn(inner));
                items.push(ImplItem::Fn(outer));
            }
            None => items.push(ImplItem::Fn(f)),
        }
    }
    imp.items = items;

    let self_ty = &imp.self_ty;
    let (impl_generics, _, where_clause) = imp.generics.split_for_impl();

    Ok(quote! {
        #imp

        impl #impl_generics ::eventhub::discovery::HubService for #self_ty #where_clause {
            fn service_name(&self) -> &'static str {
                #service_name
            }

            fn manifest(
                self: ::std::sync::Arc<Self>,
            ) -> ::eventhub::discovery::ServiceManifest {
                ::eventhub::discovery::ServiceManifest::new()
                    #( #publish_entries )*
                    #( #subscribe_entries )*
            }
        }
    })
}

fn default_service_name(ty: &Type) -> SynResult<LitStr> {
    match ty {
        Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|seg| LitStr::new(&seg.ident.to_string(), seg.ident.span()))
            .ok_or_else(|| syn::Error::new(ty.span(), "cannot infer service name")),
        other => Err(syn::Error::new(
            other.span(),
            "cannot infer service name; use #[event_hub(name = \"...\")]",
        )),
    }
}

// 剥离方法上的 #[publish] / #[subscribe]，其余属性原样保留
fn take_method_attrs(f: &mut ImplItemFn) -> SynResult<(Option<MethodAttr>, Option<MethodAttr>)> {
    let mut publish = None;
    let mut subscribe = None;
    let mut retained = Vec::with_capacity(f.attrs.len());

    for attr in std::mem::take(&mut f.attrs) {
        let (kind, slot) = if attr.path().is_ident("publish") {
            (MethodKind::Publish, &mut publish)
        } else if attr.path().is_ident("subscribe") {
            (MethodKind::Subscribe, &mut subscribe)
        } else {
            retained.push(attr);
            continue;
        };

        if slot.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "a method may carry at most one #[publish] and one #[subscribe]",
            ));
        }
        *slot = Some(parse_method_attr(&attr, kind)?);
    }

    f.attrs = retained;
    Ok((publish, subscribe))
}

fn options_tokens(attr: &MethodAttr) -> TokenStream2 {
    let setters = [
        ("hub_name", &attr.hub),
        ("routing_key", &attr.routing_key),
        ("consumer_group", &attr.consumer_group),
        ("partition_key", &attr.partition_key),
    ]
    .into_iter()
    .filter_map(|(setter, value)| {
        let setter = format_ident!("{}", setter);
        value.as_ref().map(|lit| quote! { .#setter(#lit) })
    });

    quote! {
        ::eventhub::metadata::HubOptions::builder() #( #setters )* .build()
    }
}

fn require_ref_self(f: &ImplItemFn, what: &str) -> SynResult<()> {
    match f.sig.inputs.first() {
        Some(FnArg::Receiver(r)) if r.reference.is_some() && r.mutability.is_none() => Ok(()),
        _ => Err(syn::Error::new(
            f.sig.ident.span(),
            format!("{what} methods must take `&self`"),
        )),
    }
}

/// 发布方法拆分为：隐藏的原方法 + 同名同签名的包装方法
///
/// 包装方法先等待原方法完成，再将结果交给安装位发布。
fn split_publisher(f: ImplItemFn, slots_field: &Ident) -> SynResult<(ImplItemFn, ImplItemFn)> {
    require_ref_self(&f, "#[publish]")?;
    if f.sig.asyncness.is_none() {
        return Err(syn::Error::new(
            f.sig.fn_token.span(),
            "#[publish] methods must be async",
        ));
    }
    if matches!(f.sig.output, ReturnType::Default) {
        return Err(syn::Error::new(
            f.sig.ident.span(),
            "#[publish] methods must return Result<T, E> where E: From<eventhub::HubError>",
        ));
    }

    let name = LitStr::new(&f.sig.ident.to_string(), f.sig.ident.span());
    let inner_ident = format_ident!("__event_hub_original_{}", f.sig.ident);

    let mut inner = f.clone();
    inner.sig.ident = inner_ident.clone();
    inner.vis = Visibility::Inherited;
    inner.attrs = vec![parse_quote!(#[doc(hidden)])];

    let mut outer = f;
    let mut args = Vec::new();
    for (i, arg) in outer.sig.inputs.iter_mut().enumerate() {
        if let FnArg::Typed(pt) = arg {
            let ident = format_ident!("__hub_arg{}", i);
            pt.pat = Box::new(parse_quote!(#ident));
            args.push(ident);
        }
    }
    outer.block = parse_quote!({
        let __hub_result = self.#inner_ident(#( #args ),*).await;
        self.#slots_field.intercept(#name, __hub_result).await
    });

    Ok((inner, outer))
}

fn subscriber_entry(f: &ImplItemFn, attr: &MethodAttr) -> SynResult<TokenStream2> {
    require_ref_self(f, "#[subscribe]")?;

    let typed: Vec<_> = f
        .sig
        .inputs
        .iter()
        .filter_map(|arg| match arg {
            FnArg::Typed(pt) => Some(pt),
            FnArg::Receiver(_) => None,
        })
        .collect();
    let [payload] = typed.as_slice() else {
        return Err(syn::Error::new(
            f.sig.inputs.span(),
            "#[subscribe] methods take `&self` and exactly one payload argument",
        ));
    };
    let payload_ty = &payload.ty;
    if let Type::ImplTrait(_) = &**payload_ty {
        return Err(syn::Error::new(
            payload_ty.span(),
            "#[subscribe] payload must be a concrete deserializable type",
        ));
    }

    let method = &f.sig.ident;
    let name = LitStr::new(&method.to_string(), method.span());
    let options = options_tokens(attr);

    let call = if f.sig.asyncness.is_some() {
        quote! { this.#method(__hub_payload).await }
    } else {
        quote! { this.#method(__hub_payload) }
    };
    // 返回 Result 的订阅方法，其错误转为 anyhow::Error
    let invoke = match &f.sig.output {
        ReturnType::Default => quote! { #call; },
        ReturnType::Type(..) => quote! { #call?; },
    };

    Ok(quote! {
        .subscribe(#name, #options, {
            let this = ::std::sync::Arc::clone(&self);
            move |__hub_body: ::eventhub::__private::serde_json::Value| {
                let this = ::std::sync::Arc::clone(&this);
                async move {
                    let __hub_payload: #payload_ty =
                        ::eventhub::__private::serde_json::from_value(__hub_body)?;
                    #invoke
                    ::core::result::Result::<(), ::eventhub::__private::anyhow::Error>::Ok(())
                }
            }
        })
    })
}
