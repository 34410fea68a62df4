use axum::extract::State;
use axum::response::{Html, IntoResponse};

use crate::state::AppState;

pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.broker.status();
    let agents = state.broker.list_agents();

    let agents_html: String = if agents.is_empty() {
        "<em>none</em>".into()
    } else {
        agents
            .iter()
            .map(|a| {
                let class = if a.online { "online" } else { "offline" };
                format!(
                    "<li><code>{}</code> <span class=\"{class}\">&#9679;</span> last seen {}</li>",
                    escape(&a.agent_id),
                    a.last_seen.format("%H:%M:%S"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Relay Broker</title>
<style>
  body {{ font-family: system-ui, sans-serif; max-width: 900px; margin: 2rem auto; padding: 0 1rem; background: #0d1117; color: #c9d1d9; }}
  h1 {{ color: #58a6ff; }}
  h2 {{ color: #79c0ff; border-bottom: 1px solid #21262d; padding-bottom: 0.3em; margin-top: 2em; }}
  ul {{ padding-left: 1.5em; }}
  li {{ margin: 0.3em 0; }}
  .card {{ background: #161b22; border: 1px solid #30363d; border-radius: 6px; padding: 1rem; margin: 0.5rem 0; }}
  code {{ background: #21262d; padding: 0.2em 0.4em; border-radius: 3px; font-size: 0.9em; }}
  .online {{ color: #3fb950; font-weight: bold; }}
  .offline {{ color: #f85149; }}
</style>
</head>
<body>
<h1>Relay Broker</h1>
<div class="card">
<p>Status: <span class="online">&#9679; ONLINE</span></p>
<p>Active agents: <strong>{agent_count}</strong></p>
<p>Sessions: {pending} pending &middot; {active} active &middot; {closed} closed</p>
<p>Server time: <code>{time}</code> &middot; uptime <code>{uptime}s</code></p>
<p>Version: <code>{version}</code></p>
</div>

<h2>Agents</h2>
<div class="card">
<ul>{agents_html}</ul>
</div>

<p>Connect agents and controllers to <code>/v1/ws?role=agent</code> or
<code>/v1/ws?role=controller</code>.</p>
</body>
</html>"#,
        agent_count = status.agent_count,
        pending = status.sessions.pending,
        active = status.sessions.active,
        closed = status.sessions.closed,
        time = status.timestamp.format("%H:%M:%S"),
        uptime = status.uptime_secs,
        version = rb_broker::BROKER_VERSION,
    );

    Html(html)
}

/// Agent ids are client-chosen.
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::escape;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }
}
