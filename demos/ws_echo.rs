use spinnerette::ws::connection::{Message, WebSocketConnection, WsHandler};
use spinnerette::{Handled, Handler, Request, Response, Server, StatusCode};
use tokio::net::TcpListener;

struct Upgrade;

impl Handler for Upgrade {
    async fn handle(&self, _: &mut (), req: &Request<'_>, resp: &mut Response) -> Handled {
        if req.is_websocket_upgrade() {
            // The connection runtime intercepts upgrade requests before a
            // handler ever sees them when a `ws_handler` is configured; this
            // branch only runs for plain HTTP requests to the same path.
            return resp
                .status(StatusCode::UpgradeRequired)
                .body("expected a WebSocket handshake");
        }

        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("send a WebSocket upgrade request to talk to the echo handler")
    }
}

struct Echo;

impl WsHandler for Echo {
    fn on_message(&self, _: &mut (), conn: &WebSocketConnection, message: Message) {
        match message {
            Message::Text(text) => conn.send_text(text),
            Message::Binary(data) => conn.send_binary(data),
        }
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Upgrade)
        .ws_handler(Echo)
        .build()
        .launch()
        .await;
}
