use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::Decoder;

use redish::codec::FrameCodec;
use redish::frame::Frame;

async fn create_tcp_connection() -> Result<(UnboundedSender<Vec<u8>>, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            while let Some(data) = rx.recv().await {
                // Write the received channel data to the socket.
                if socket.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    // Connect to the server as a client to complete the setup.
    let stream = TcpStream::connect(local_addr).await?;

    Ok((tx, stream))
}

// The same read path the connection uses: buffer socket bytes and hand them
// to the codec until a whole frame is available.
async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> Option<Frame> {
    let mut codec = FrameCodec::new();
    loop {
        if let Some(frame) = codec.decode(buffer).unwrap() {
            return Some(frame);
        }
        if stream.read_buf(buffer).await.unwrap() == 0 {
            return None;
        }
    }
}

#[tokio::test]
async fn test_parse_simple_string() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"+OK\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Simple("OK".to_string())));
}

#[tokio::test]
async fn test_parse_bulk_string() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"$5\r\nhello\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Bulk(Bytes::from("hello"))));
}

#[tokio::test]
async fn test_parse_array() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote
        .send(b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n".to_vec())
        .unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(
        actual,
        Some(Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("mykey")),
            Frame::Bulk(Bytes::from("myvalue")),
        ]))
    );
}

#[tokio::test]
async fn test_parse_simple_error() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"-Error message\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Error(String::from("Error message"))));
}

#[tokio::test]
async fn test_parse_integer() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b":1000\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Integer(1000)));
}

#[tokio::test]
async fn test_parse_null_bulk_string() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"$-1\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Null));
}

#[tokio::test]
async fn test_parse_resp3_map() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote
        .send(b"%2\r\n+proto\r\n:3\r\n+role\r\n$6\r\nmaster\r\n".to_vec())
        .unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(
        actual,
        Some(Frame::Map(vec![
            (Frame::Simple("proto".to_string()), Frame::Integer(3)),
            (
                Frame::Simple("role".to_string()),
                Frame::Bulk(Bytes::from("master"))
            ),
        ]))
    );
}

#[tokio::test]
async fn test_parse_resp3_push() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote
        .send(b">2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n".to_vec())
        .unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(
        actual,
        Some(Frame::Push(vec![
            Frame::Bulk(Bytes::from("invalidate")),
            Frame::Array(vec![Frame::Bulk(Bytes::from("foo"))]),
        ]))
    );
}

#[tokio::test]
async fn test_parse_multiple_frames_sequentially() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"+OK\r\n".to_vec()).unwrap();
    remote.send(b"$5\r\nhello\r\n".to_vec()).unwrap();
    remote.send(b"-Error message\r\n".to_vec()).unwrap();
    remote.send(b":1000\r\n".to_vec()).unwrap();
    remote.send(b"#t\r\n".to_vec()).unwrap();
    remote.send(b",3.25\r\n".to_vec()).unwrap();

    let expected = vec![
        Frame::Simple("OK".to_string()),
        Frame::Bulk(Bytes::from("hello")),
        Frame::Error(String::from("Error message")),
        Frame::Integer(1000),
        Frame::Boolean(true),
        Frame::Double(3.25),
    ];
    for frame in expected {
        let actual = read_frame(&mut stream, &mut buffer).await;
        assert_eq!(actual, Some(frame));
    }
}

#[tokio::test]
async fn test_parse_incomplete_frame() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    // Command split into three parts to simulate partial/incomplete data sending.
    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n";
    let part1 = b"*3\r\n$3\r\nSE";
    let part2 = b"T\r\n$5\r\nmyke";
    let part3 = b"y\r\n$7\r\nmyvalue\r\n";

    tokio::spawn(async move {
        let parts = vec![part1.to_vec(), part2.to_vec(), part3.to_vec()];
        for part in parts {
            remote.send(part.to_vec()).unwrap();
            // Simulate a delay in sending/receiving the data.
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    });

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(
        actual,
        Some(Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("mykey")),
            Frame::Bulk(Bytes::from("myvalue")),
        ]))
    );
}

#[tokio::test]
async fn test_parse_bulk_payload_containing_crlf() {
    let (remote, mut stream) = create_tcp_connection().await.unwrap();
    let mut buffer = BytesMut::new();

    remote.send(b"$12\r\nline1\r\nline2\r\n".to_vec()).unwrap();

    let actual = read_frame(&mut stream, &mut buffer).await;
    assert_eq!(actual, Some(Frame::Bulk(Bytes::from("line1\r\nline2"))));
}
