use proc_macro::TokenStream;
use syn::{Item, parse_macro_input, spanned::Spanned};

mod attrs;
mod event_hub;

/// 事件中枢服务宏
///
/// 标注在服务的固有 `impl` 块上，读取方法上的标记并生成 `::eventhub::discovery::HubService` 实现：
/// - `#[publish(hub = "...", routing_key = "...", partition_key = "...")]`：
///   方法须为 `async fn(&self, ..) -> Result<T, E>`，且 `E: From<eventhub::HubError>`；
///   原方法体执行完成后，返回值经服务上的 `PublisherSlots` 字段发送到 hub；
/// - `#[subscribe(hub = "...", routing_key = "...", consumer_group = "...")]`：
///   方法接收 `&self` 与一个可反序列化的消息体参数，返回 `()` 或 `Result<_, E>`；
/// - 同一方法可同时带有两种标记（收到消息后再发布）。
///
/// 宏参数：
/// - `name = "..."`：服务名，默认取类型名；
/// - `publishers = field`：`PublisherSlots` 字段名，默认 `publishers`。
#[proc_macro_attribute]
pub fn event_hub(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as attrs::EventHubAttrConfig);
    let input = parse_macro_input!(item as Item);

    let imp = match input {
        Item::Impl(imp) => imp,
        other => {
            return syn::Error::new(other.span(), "#[event_hub] can only be used on impl blocks")
                .to_compile_error()
                .into();
        }
    };

    match event_hub::expand(cfg, imp) {
        Ok(out) => TokenStream::from(out),
        Err(err) => err.to_compile_error().into(),
    }
}
