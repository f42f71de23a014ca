use syn::punctuated::Punctuated;
use syn::{
    Attribute, Expr, Ident, LitStr, Result as SynResult, Token, parse::Parse, parse::ParseStream,
    spanned::Spanned,
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MethodKind {
    Publish,
    Subscribe,
}

impl MethodKind {
    fn attr_name(self) -> &'static str {
        match self {
            MethodKind::Publish => "publish",
            MethodKind::Subscribe => "subscribe",
        }
    }
}

// key = value
struct AttrKv {
    key: Ident,
    #[allow(dead_code)]
    eq: Token![=],
    value: Expr,
}

impl Parse for AttrKv {
    fn parse(input: ParseStream) -> SynResult<Self> {
        Ok(Self {
            key: input.parse()?,
            eq: input.parse()?,
            value: input.parse()?,
        })
    }
}

fn expect_str(key: &Ident, value: Expr) -> SynResult<LitStr> {
    match value {
        Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Str(lit),
            ..
        }) => Ok(lit),
        other => Err(syn::Error::new(
            other.span(),
            format!("expected string literal for '{key}'"),
        )),
    }
}

fn set_once<T>(slot: &mut Option<T>, key: &Ident, value: T) -> SynResult<()> {
    if slot.is_some() {
        return Err(syn::Error::new(
            key.span(),
            format!("duplicate key '{key}' in attribute"),
        ));
    }
    *slot = Some(value);
    Ok(())
}

// 解析 event_hub 宏参数：name = "..."、publishers = field
#[derive(Default)]
pub(crate) struct EventHubAttrConfig {
    pub(crate) name: Option<LitStr>,
    pub(crate) publishers: Option<Ident>,
}

impl Parse for EventHubAttrConfig {
    fn parse(input: ParseStream) -> SynResult<Self> {
        let mut cfg = Self::default();
        if input.is_empty() {
            return Ok(cfg);
        }

        let pairs = Punctuated::<AttrKv, Token![,]>::parse_terminated(input)?;
        for kv in pairs {
            match kv.key.to_string().as_str() {
                "name" => {
                    let lit = expect_str(&kv.key, kv.value)?;
                    set_once(&mut cfg.name, &kv.key, lit)?;
                }
                "publishers" => {
                    let field = match &kv.value {
                        Expr::Path(p) if p.qself.is_none() => p.path.get_ident().cloned(),
                        _ => None,
                    };
                    let field = field.ok_or_else(|| {
                        syn::Error::new(kv.value.span(), "expected a field name for 'publishers'")
                    })?;
                    set_once(&mut cfg.publishers, &kv.key, field)?;
                }
                _ => {
                    return Err(syn::Error::new(
                        kv.key.span(),
                        "unknown key in attribute; expected 'name' | 'publishers'",
                    ));
                }
            }
        }
        Ok(cfg)
    }
}

/// 方法上的 `#[publish(..)]` / `#[subscribe(..)]`
pub(crate) struct MethodAttr {
    pub(crate) hub: Option<LitStr>,
    pub(crate) routing_key: Option<LitStr>,
    pub(crate) consumer_group: Option<LitStr>,
    pub(crate) partition_key: Option<LitStr>,
}

pub(crate) fn parse_method_attr(attr: &Attribute, kind: MethodKind) -> SynResult<MethodAttr> {
    let mut out = MethodAttr {
        hub: None,
        routing_key: None,
        consumer_group: None,
        partition_key: None,
    };

    let pairs = match &attr.meta {
        syn::Meta::Path(_) => return Ok(out),
        syn::Meta::List(_) => {
            attr.parse_args_with(Punctuated::<AttrKv, Token![,]>::parse_terminated)?
        }
        other => {
            return Err(syn::Error::new(
                other.span(),
                format!("expected #[{}(...)]", kind.attr_name()),
            ));
        }
    };

    for kv in pairs {
        let key = kv.key.to_string();
        match (key.as_str(), kind) {
            ("hub" | "hub_name", _) => {
                let lit = expect_str(&kv.key, kv.value)?;
                set_once(&mut out.hub, &kv.key, lit)?;
            }
            ("routing_key", _) => {
                let lit = expect_str(&kv.key, kv.value)?;
                set_once(&mut out.routing_key, &kv.key, lit)?;
            }
            ("consumer_group", MethodKind::Subscribe) => {
                let lit = expect_str(&kv.key, kv.value)?;
                set_once(&mut out.consumer_group, &kv.key, lit)?;
            }
            ("partition_key", MethodKind::Publish) => {
                let lit = expect_str(&kv.key, kv.value)?;
                set_once(&mut out.partition_key, &kv.key, lit)?;
            }
            _ => {
                let expected = match kind {
                    MethodKind::Publish => "'hub' | 'routing_key' | 'partition_key'",
                    MethodKind::Subscribe => "'hub' | 'routing_key' | 'consumer_group'",
                };
                return Err(syn::Error::new(
                    kv.key.span(),
                    format!(
                        "unknown key for #[{}]; expected {expected}",
                        kind.attr_name()
                    ),
                ));
            }
        }
    }

    Ok(out)
}
