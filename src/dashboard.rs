use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::live_status::{LiveStatus, LiveView};

const BOUNDARY: &str = "frame";
const FRAME_POLL: Duration = Duration::from_millis(50);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Fall Monitor</title>
<style>
body { font-family: sans-serif; background: #111; color: #eee; margin: 2em; }
#state { font-size: 2em; font-weight: bold; }
.Confirmed { color: #f33; } .Unstable, .Falling { color: #fb3; } .Stable { color: #3c3; }
td { padding: 0 1em 0 0; }
</style>
</head>
<body>
<h1>Fall Monitor</h1>
<img src="/video_feed" width="640" alt="live feed">
<p id="state">-</p>
<table>
<tr><td>Frames</td><td id="frames">0</td></tr>
<tr><td>FPS</td><td id="fps">0</td></tr>
<tr><td>Incidents</td><td id="incidents">0</td></tr>
<tr><td>Modem</td><td id="modem">-</td></tr>
<tr><td>CPU / memory</td><td id="resources">-</td></tr>
</table>
<script>
async function refresh() {
  try {
    const s = await (await fetch('/status')).json();
    const el = document.getElementById('state');
    el.textContent = s.state_label;
    el.className = s.fall_state;
    document.getElementById('frames').textContent = s.frames_processed;
    document.getElementById('fps').textContent = s.fps.toFixed(1);
    document.getElementById('incidents').textContent = s.incidents_detected;
    document.getElementById('modem').textContent = s.modem_status;
    const cpu = s.cpu_percent == null ? '-' : s.cpu_percent.toFixed(1) + '%';
    const mem = s.memory_mb == null ? '-' : s.memory_mb.toFixed(1) + ' MB';
    document.getElementById('resources').textContent = cpu + ' / ' + mem;
  } catch (e) {}
}
setInterval(refresh, 500);
refresh();
</script>
</body>
</html>
"#;

pub fn router(view: LiveView) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/video_feed", get(video_feed_handler))
        .with_state(view)
}

pub async fn start_dashboard(view: LiveView, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    log::info!("[DASHBOARD] Starting embedded server at http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router(view)).await
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status_handler(State(view): State<LiveView>) -> Json<LiveStatus> {
    Json(view.status().await)
}

/// MJPEG stream: each new frame replaces the previous one in the browser.
async fn video_feed_handler(State(view): State<LiveView>) -> impl IntoResponse {
    let frames = futures::stream::unfold((view, None), |(view, last)| async move {
        loop {
            if let Some(jpeg) = view.latest_frame().await {
                let is_new = last
                    .as_ref()
                    .map(|prev: &Arc<Vec<u8>>| !Arc::ptr_eq(prev, &jpeg))
                    .unwrap_or(true);
                if is_new {
                    let part = multipart_part(&jpeg);
                    return Some((Ok::<Bytes, Infallible>(part), (view, Some(jpeg))));
                }
            }
            sleep(FRAME_POLL).await;
        }
    });

    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        )],
        Body::from_stream(frames),
    )
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fall_state::FallState;

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(&[1, 2, 3]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n"));
        assert!(part.ends_with(&[1, 2, 3, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_status_handler_returns_published_status() {
        let view = LiveView::new();
        let publisher = view.clone();
        tokio::task::spawn_blocking(move || {
            let mut status = LiveStatus::new();
            status.fall_state = FallState::Confirmed;
            status.incidents_detected = 1;
            publisher.publish_status(status);
        })
        .await
        .unwrap();

        let Json(status) = status_handler(State(view)).await;
        assert_eq!(status.fall_state, FallState::Confirmed);
        assert_eq!(status.incidents_detected, 1);
    }

    #[tokio::test]
    async fn test_index_page_polls_status() {
        let Html(page) = index_handler().await;
        assert!(page.contains("/status"));
        assert!(page.contains("/video_feed"));
    }
}
