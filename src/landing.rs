//! Landing page listing running clusters and their web UIs

use crate::config::NodePorts;
use crate::rewrite::PROXY_PATH_PREFIX;
use crate::runtime::{ClusterListing, ContainerRuntime};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::fmt::Write;
use tracing::warn;

/// Renders the landing page from the runtime's cluster listing
pub struct LandingPage {
    runtime: ContainerRuntime,
    ports: NodePorts,
}

impl LandingPage {
    pub fn new(runtime: ContainerRuntime, ports: NodePorts) -> Self {
        Self { runtime, ports }
    }

    /// List running clusters and render them. A failed listing renders as no clusters.
    pub async fn render(&self) -> String {
        let clusters = match self.runtime.list_clusters().await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "Failed to list clusters for landing page");
                Vec::new()
            }
        };
        render(&clusters, &self.ports)
    }

    pub async fn serve(&self) -> Response<Full<Bytes>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(self.render().await)))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Escape text for HTML element content and quoted attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render the landing page HTML for the given clusters
pub fn render(clusters: &[ClusterListing], ports: &NodePorts) -> String {
    let mut html = String::from(LANDING_HEAD);

    if clusters.is_empty() {
        html.push_str(
            "<p class=\"empty\">No running clusters. Start a cluster and reload this page.</p>\n",
        );
    }

    for cluster in clusters {
        let name = escape_html(&cluster.name);
        let _ = writeln!(html, "<section class=\"cluster\">\n<h2>{}</h2>\n<table>", name);
        html.push_str("<tr><th>Node</th><th>Status</th><th>Web UIs</th></tr>\n");

        for node in &cluster.nodes {
            let container = escape_html(&node.container);
            let links: Vec<String> = ports
                .labelled()
                .iter()
                .map(|(label, port)| {
                    format!(
                        "<a href=\"{}{}:{}/\">{} :{}</a>",
                        PROXY_PATH_PREFIX, container, port, label, port
                    )
                })
                .collect();

            let _ = writeln!(
                html,
                "<tr><td>{} <small>(node {})</small></td><td>{}</td><td>{}</td></tr>",
                container,
                node.node,
                escape_html(&node.status),
                links.join(" ")
            );
        }
        html.push_str("</table>\n</section>\n");
    }

    html.push_str(LANDING_FOOT);
    html
}

/// Inline SVG icon served for `/favicon.ico` and `/favicon.svg`
pub fn serve_favicon() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "image/svg+xml")
        .header("Cache-Control", "public, max-age=86400")
        .body(Full::new(Bytes::from_static(FAVICON_SVG.as_bytes())))
        .expect("valid response with StatusCode enum and static headers")
}

const FAVICON_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 32 32"><rect width="32" height="32" rx="6" fill="#1f2a44"/><ellipse cx="16" cy="9" rx="9" ry="3.5" fill="#ff6e42"/><path d="M7 9v14c0 1.9 4 3.5 9 3.5s9-1.6 9-3.5V9" fill="none" stroke="#ff6e42" stroke-width="2"/><path d="M7 16c0 1.9 4 3.5 9 3.5s9-1.6 9-3.5" fill="none" stroke="#ff6e42" stroke-width="2"/></svg>"##;

const LANDING_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>nodegate - cluster consoles</title>
<link rel="icon" href="/favicon.svg" type="image/svg+xml">
<style>
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; margin: 2rem; color: #1f2a44; }
h1 { font-size: 1.5rem; }
section.cluster { margin-bottom: 2rem; }
table { border-collapse: collapse; }
th, td { text-align: left; padding: 0.35rem 0.8rem; border-bottom: 1px solid #e3e6ee; }
td a { margin-right: 0.6rem; white-space: nowrap; }
small { color: #6b7385; }
.empty { color: #6b7385; }
</style>
</head>
<body>
<h1>Cluster web consoles</h1>
"#;

const LANDING_FOOT: &str = "</body>\n</html>\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ExecError, ShellExecutor};
    use crate::runtime::NodeListing;
    use futures::future::BoxFuture;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;

    /// Every command fails the same way
    struct BrokenRuntime {
        timed_out: bool,
    }

    impl ShellExecutor for BrokenRuntime {
        fn run<'a>(
            &'a self,
            _command_line: &'a str,
            timeout: Duration,
        ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
            Box::pin(async move {
                if self.timed_out {
                    Err(ExecError::TimedOut(timeout))
                } else {
                    Ok(CommandOutput::failed(
                        1,
                        "Cannot connect to the Docker daemon. Is the docker daemon running?",
                    ))
                }
            })
        }
    }

    fn cluster(name: &str, nodes: u32) -> ClusterListing {
        ClusterListing {
            name: name.to_string(),
            nodes: (1..=nodes)
                .map(|n| NodeListing {
                    container: format!("yb-{}-node{}", name, n),
                    node: n,
                    status: "Up 5 minutes".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }

    #[test]
    fn test_render_empty_state() {
        let html = render(&[], &NodePorts::default());
        assert!(html.contains("No running clusters"));
        assert!(!html.contains("/proxy/"));
        assert!(html.ends_with("</html>\n"));
    }

    #[test]
    fn test_render_links_per_node() {
        let html = render(&[cluster("demo", 1), cluster("other", 1)], &NodePorts::default());

        assert!(html.contains("<h2>demo</h2>"));
        assert!(html.contains("<h2>other</h2>"));
        assert_eq!(html.matches("href=\"/proxy/").count(), 10);
        for port in [7000, 9000, 15433, 7100, 9100] {
            assert!(html.contains(&format!("href=\"/proxy/yb-demo-node1:{}/\"", port)));
            assert!(html.contains(&format!("href=\"/proxy/yb-other-node1:{}/\"", port)));
        }
        assert!(html.contains("Up 5 minutes"));
    }

    #[test]
    fn test_render_uses_configured_ports() {
        let ports = NodePorts {
            db_ui: 15999,
            ..NodePorts::default()
        };
        let html = render(&[cluster("demo", 2)], &ports);
        assert!(html.contains("href=\"/proxy/yb-demo-node2:15999/\""));
        assert!(!html.contains(":15433/"));
        assert_eq!(html.matches("href=\"/proxy/").count(), 10);
    }

    #[tokio::test]
    async fn test_listing_failure_renders_empty_page() {
        for timed_out in [false, true] {
            let runtime = ContainerRuntime::new(
                Arc::new(BrokenRuntime { timed_out }),
                "docker",
                "yb",
                Duration::from_secs(5),
            );
            let page = LandingPage::new(runtime, NodePorts::default());

            let response = page.serve().await;
            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let html = String::from_utf8(body.to_vec()).unwrap();
            assert!(html.contains("No running clusters"));
            assert!(!html.contains("/proxy/"));
            assert!(!html.contains("Docker daemon"));
        }
    }

    #[test]
    fn test_serve_favicon() {
        let response = serve_favicon();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );
    }
}
