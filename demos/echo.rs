use mprpc::{Client, EndpointConfig, Methods, ServerConn, Service};
use tokio::{net::TcpListener, task};

pub struct Echo;

impl Echo {
    fn echo(&self, line: String, reply: &mut String) -> Result<(), String> {
        *reply = line;
        Ok(())
    }

    fn shout(&self, line: String) -> Result<(), String> {
        println!("{}", line.to_uppercase());
        Ok(())
    }
}

impl Service for Echo {
    fn methods(methods: &mut Methods<Self>) {
        methods.call("Echo", Echo::echo).notify("Shout", Echo::shout);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:18800").await.unwrap();
    task::spawn(async move {
        loop {
            let (sock, _) = listener.accept().await.unwrap();
            let config = EndpointConfig::builder().name("server".to_string()).build();
            let conn = ServerConn::new(sock, config);
            conn.register(Echo).unwrap();
            task::spawn(async move { conn.serve().await });
        }
    });

    let client = Client::connect("127.0.0.1:18800").await.unwrap();
    client.notify("Shout", ("hello",)).await.unwrap();
    let retval: String = client.call("Echo", ("hello, world",)).await.unwrap();
    println!("{retval}");
    client.shutdown().await.unwrap();
}
