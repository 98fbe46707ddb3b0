use std::convert::Infallible;

use agent::{AgentEvent, EventItem};
use axum::response::sse::Event;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, error};

/// ストリーム途中でエラーが起きた場合に送る `event: error` フレームの本文
pub const STREAM_ERROR_MESSAGE: &str = "Agent processing failed";

/// エージェントのイベント列をSSEフレーム列に変換する
///
/// テキスト断片（`AgentEvent::Data`）だけを届いた順に1フレームずつ送り、
/// それ以外のイベントは読み捨てる。エラーを受け取った場合は `event: error`
/// フレームを1つ送ってストリームを終える。
///
/// # Arguments
/// * `events` - エージェントのイベント列。戻り値のストリームが破棄されると一緒に破棄される
pub fn event_to_sse_stream<S>(events: S) -> impl Stream<Item = Result<Event, Infallible>> + Send
where
    S: Stream<Item = EventItem> + Send + Unpin + 'static,
{
    futures::stream::unfold((events, false), |(mut events, done)| async move {
        if done {
            return None;
        }

        loop {
            match events.next().await {
                Some(Ok(AgentEvent::Data(text))) => {
                    let sse_event = Event::default().data(sanitize(&text));
                    return Some((Ok(sse_event), (events, false)));
                }
                Some(Ok(other)) => {
                    debug!(event = ?other, "skipping non-text event");
                    continue;
                }
                Some(Err(e)) => {
                    error!(error = %e, "agent stream failed after streaming started");
                    let sse_event = Event::default().event("error").data(STREAM_ERROR_MESSAGE);
                    return Some((Ok(sse_event), (events, true)));
                }
                None => return None,
            }
        }
    })
}

/// SSEの `data` フィールドに含められない `\r` を取り除く
///
/// `\r\n` は `\n` に、単独の `\r` は `\n` に置き換える。改行は
/// 複数の `data:` 行として送られ、クライアント側で `\n` に戻される。
fn sanitize(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
