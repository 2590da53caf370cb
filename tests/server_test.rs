//! End-to-end tests driving the server core through in-process clients
//!
//! Each test builds a `Server`, attaches mock clients, and feeds argv
//! vectors straight into dispatch, asserting on the raw protocol bytes
//! that come back.

use ember::config::Config;
use ember::propagate::RecordingPropagator;
use ember::server::Server;
use ember::ClientId;

fn server() -> Server {
    Server::new(Config::default())
}

fn server_with(config: Config) -> Server {
    Server::new(config)
}

fn run(s: &mut Server, id: ClientId, parts: &[&str]) -> Vec<u8> {
    let argv: Vec<Vec<u8>> = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
    s.execute(id, argv);
    s.take_output(id)
}

fn run_owned(s: &mut Server, id: ClientId, parts: Vec<Vec<u8>>) -> Vec<u8> {
    s.execute(id, parts);
    s.take_output(id)
}

#[test]
fn test_set_get_roundtrip() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["SET", "foo", "bar"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["GET", "foo"]), b"$3\r\nbar\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["DEL", "foo"]), b":1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["GET", "foo"]), b"$-1\r\n".to_vec());
}

#[test]
fn test_case_insensitive_dispatch() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["SeT", "k", "v"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["get", "k"]), b"$1\r\nv\r\n".to_vec());
}

#[test]
fn test_unknown_command_and_arity() {
    let mut s = server();
    let c = s.mock_client();
    let out = run(&mut s, c, &["NOPE"]);
    assert!(out.starts_with(b"-ERR unknown command"));
    let out = run(&mut s, c, &["GET"]);
    assert!(out.starts_with(b"-ERR wrong number of arguments"));
}

#[test]
fn test_wrong_type_error() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["RPUSH", "mylist", "a"]);
    let out = run(&mut s, c, &["GET", "mylist"]);
    assert!(out.starts_with(b"-WRONGTYPE"));
    let out = run(&mut s, c, &["INCR", "mylist"]);
    assert!(out.starts_with(b"-WRONGTYPE"));
}

#[test]
fn test_find_all_keys_during_rehash() {
    let mut s = server();
    let c = s.mock_client();
    for i in 0..10_000 {
        let k = format!("key:{i}");
        let v = format!("val:{i}");
        assert_eq!(run(&mut s, c, &["SET", &k, &v]), b"+OK\r\n".to_vec());
    }
    assert_eq!(s.dbs[0].len(), 10_000);
    for i in 0..10_000 {
        let k = format!("key:{i}");
        let v = format!("val:{i}");
        let expected = format!("${}\r\n{}\r\n", v.len(), v);
        assert_eq!(run(&mut s, c, &["GET", &k]), expected.into_bytes());
    }
    assert_eq!(run(&mut s, c, &["DBSIZE"]), b":10000\r\n".to_vec());
}

#[test]
fn test_string_encodings_observable() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "n", "12345"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "n"]),
        b"$3\r\nint\r\n".to_vec()
    );
    run(&mut s, c, &["SET", "s", "short string"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "s"]),
        b"$6\r\nembstr\r\n".to_vec()
    );
    let long = "x".repeat(64);
    run(&mut s, c, &["SET", "l", &long]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "l"]),
        b"$3\r\nraw\r\n".to_vec()
    );
    // APPEND degrades int -> raw, one way.
    run(&mut s, c, &["APPEND", "n", "x"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "n"]),
        b"$3\r\nraw\r\n".to_vec()
    );
}

#[test]
fn test_incr_family() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["INCR", "n"]), b":1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["INCRBY", "n", "41"]), b":42\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["DECR", "n"]), b":41\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["DECRBY", "n", "40"]), b":1\r\n".to_vec());
    run(&mut s, c, &["SET", "n", "9223372036854775807"]);
    let out = run(&mut s, c, &["INCR", "n"]);
    assert!(out.starts_with(b"-ERR increment or decrement would overflow"));
    run(&mut s, c, &["SET", "w", "abc"]);
    let out = run(&mut s, c, &["INCR", "w"]);
    assert!(out.starts_with(b"-ERR value is not an integer"));
    assert_eq!(
        run(&mut s, c, &["INCRBYFLOAT", "f", "10.5"]),
        b"$4\r\n10.5\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["INCRBYFLOAT", "f", "0.1"]),
        b"$4\r\n10.6\r\n".to_vec()
    );
}

#[test]
fn test_incr_keeps_ttl() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "n", "1"]);
    run(&mut s, c, &["PEXPIRE", "n", "500000"]);
    run(&mut s, c, &["INCR", "n"]);
    let out = run(&mut s, c, &["PTTL", "n"]);
    assert!(out.starts_with(b":"), "got {out:?}");
    assert_ne!(out, b":-1\r\n".to_vec(), "INCR must not clear the TTL");
    // SET does clear it.
    run(&mut s, c, &["SET", "n", "5"]);
    assert_eq!(run(&mut s, c, &["PTTL", "n"]), b":-1\r\n".to_vec());
}

#[test]
fn test_setrange_getrange_strlen() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(
        run(&mut s, c, &["SETRANGE", "k", "5", "world"]),
        b":10\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["GETRANGE", "k", "5", "-1"]),
        b"$5\r\nworld\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["STRLEN", "k"]), b":10\r\n".to_vec());
    run(&mut s, c, &["SET", "h", "Hello World"]);
    assert_eq!(
        run(&mut s, c, &["GETRANGE", "h", "0", "4"]),
        b"$5\r\nHello\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["GETRANGE", "h", "-5", "-1"]),
        b"$5\r\nWorld\r\n".to_vec()
    );
}

#[test]
fn test_mset_mget_msetnx() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(
        run(&mut s, c, &["MSET", "a", "1", "b", "2"]),
        b"+OK\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["MGET", "a", "b", "missing"]),
        b"*3\r\n$1\r\n1\r\n$1\r\n2\r\n$-1\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["MSETNX", "b", "x", "c", "y"]),
        b":0\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["GET", "c"]), b"$-1\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["MSETNX", "c", "3", "d", "4"]),
        b":1\r\n".to_vec()
    );
}

#[test]
fn test_list_push_pop_range() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["RPUSH", "l", "a", "b", "c"]), b":3\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["LPUSH", "l", "z"]), b":4\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["LRANGE", "l", "0", "-1"]),
        b"*4\r\n$1\r\nz\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["LPOP", "l"]), b"$1\r\nz\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["RPOP", "l"]), b"$1\r\nc\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["LLEN", "l"]), b":2\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["LINDEX", "l", "-1"]), b"$1\r\nb\r\n".to_vec());
    // popping everything removes the key
    run(&mut s, c, &["LPOP", "l"]);
    run(&mut s, c, &["LPOP", "l"]);
    assert_eq!(run(&mut s, c, &["EXISTS", "l"]), b":0\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["LPOP", "l"]), b"$-1\r\n".to_vec());
}

#[test]
fn test_list_modify() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["RPUSH", "l", "a", "b", "c", "b"]);
    assert_eq!(
        run(&mut s, c, &["LINSERT", "l", "BEFORE", "b", "x"]),
        b":5\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["LINSERT", "l", "AFTER", "c", "y"]),
        b":6\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["LINSERT", "l", "BEFORE", "nope", "z"]),
        b":-1\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["LSET", "l", "0", "A"]), b"+OK\r\n".to_vec());
    let out = run(&mut s, c, &["LSET", "l", "99", "X"]);
    assert!(out.starts_with(b"-ERR index out of range"));
    assert_eq!(run(&mut s, c, &["LREM", "l", "0", "b"]), b":2\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["LRANGE", "l", "0", "-1"]),
        b"*4\r\n$1\r\nA\r\n$1\r\nx\r\n$1\r\nc\r\n$1\r\ny\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["LTRIM", "l", "1", "2"]), b"+OK\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["LRANGE", "l", "0", "-1"]),
        b"*2\r\n$1\r\nx\r\n$1\r\nc\r\n".to_vec()
    );
}

#[test]
fn test_rpoplpush() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["RPUSH", "src", "a", "b", "c"]);
    assert_eq!(
        run(&mut s, c, &["RPOPLPUSH", "src", "dst"]),
        b"$1\r\nc\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["RPOPLPUSH", "src", "dst"]),
        b"$1\r\nb\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["LRANGE", "dst", "0", "-1"]),
        b"*2\r\n$1\r\nb\r\n$1\r\nc\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["RPOPLPUSH", "empty", "dst"]),
        b"$-1\r\n".to_vec()
    );
}

#[test]
fn test_list_encoding_transition_and_compression() {
    let mut s = server_with(Config {
        list_fill: -1,
        list_compress_depth: 1,
        ..Config::default()
    });
    let c = s.mock_client();
    run(&mut s, c, &["RPUSH", "mylist", "a", "b", "c"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "mylist"]),
        b"$9\r\nquicklist\r\n".to_vec()
    );
    {
        let obj = s.dbs[0].peek(b"mylist").unwrap();
        assert_eq!(obj.list_ref().node_count(), 1);
    }
    let payload = "p".repeat(1024);
    for i in 0..10_000 {
        let v = format!("{i}:{payload}");
        run_owned(
            &mut s,
            c,
            vec![b"RPUSH".to_vec(), b"mylist".to_vec(), v.into_bytes()],
        );
    }
    let summary = {
        let obj = s.dbs[0].peek(b"mylist").unwrap();
        obj.list_ref().node_summary()
    };
    assert!(summary.len() > 1, "large list must span nodes");
    assert!(!summary.first().unwrap().1, "head stays raw");
    assert!(!summary.last().unwrap().1, "tail stays raw");
    let compressed = summary[1..summary.len() - 1]
        .iter()
        .filter(|(_, z)| *z)
        .count();
    assert!(
        compressed >= summary.len().saturating_sub(3),
        "interior nodes must be compressed: {} of {}",
        compressed,
        summary.len()
    );
    // Full range preserves insertion order through the compressed middle.
    let out = run(&mut s, c, &["LRANGE", "mylist", "0", "-1"]);
    let header_end = out.iter().position(|&b| b == b'\n').unwrap();
    assert_eq!(&out[..header_end + 1], b"*10003\r\n");
    assert_eq!(run(&mut s, c, &["LLEN", "mylist"]), b":10003\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["LINDEX", "mylist", "0"]), b"$1\r\na\r\n".to_vec());
    let out = run(&mut s, c, &["LINDEX", "mylist", "3"]);
    assert!(out.ends_with(format!("0:{payload}\r\n").as_bytes()));
}

#[test]
fn test_hash_commands() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(
        run(&mut s, c, &["HSET", "h", "f1", "v1", "f2", "v2"]),
        b":2\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["HSET", "h", "f1", "v1b"]), b":0\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HGET", "h", "f1"]), b"$3\r\nv1b\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HGET", "h", "nope"]), b"$-1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HLEN", "h"]), b":2\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HSTRLEN", "h", "f2"]), b":2\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HEXISTS", "h", "f2"]), b":1\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["HMGET", "h", "f2", "zz"]),
        b"*2\r\n$2\r\nv2\r\n$-1\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, c, &["HGETALL", "h"]),
        b"*4\r\n$2\r\nf1\r\n$3\r\nv1b\r\n$2\r\nf2\r\n$2\r\nv2\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["HSETNX", "h", "f1", "x"]), b":0\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HSETNX", "h", "f3", "x"]), b":1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HDEL", "h", "f1", "f3", "zz"]), b":2\r\n".to_vec());
    // deleting the last field removes the key
    run(&mut s, c, &["HDEL", "h", "f2"]);
    assert_eq!(run(&mut s, c, &["EXISTS", "h"]), b":0\r\n".to_vec());
}

#[test]
fn test_hash_encoding_transition() {
    let mut s = server_with(Config {
        hash_max_packed_entries: 4,
        hash_max_packed_value: 16,
        ..Config::default()
    });
    let c = s.mock_client();
    run(&mut s, c, &["HSET", "h", "f", "v"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "h"]),
        b"$6\r\npacked\r\n".to_vec()
    );
    // Oversized value forces the general encoding.
    run(&mut s, c, &["HSET", "h", "big", "01234567890123456789"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "h"]),
        b"$9\r\nhashtable\r\n".to_vec()
    );
    // It never converts back, even after deleting everything offensive.
    run(&mut s, c, &["HDEL", "h", "big"]);
    assert_eq!(
        run(&mut s, c, &["OBJECT", "ENCODING", "h"]),
        b"$9\r\nhashtable\r\n".to_vec()
    );
    // Entry-count trigger on a second key.
    let c2 = s.mock_client();
    for i in 0..5 {
        let f = format!("f{i}");
        run(&mut s, c2, &["HSET", "h2", &f, "v"]);
    }
    assert_eq!(
        run(&mut s, c2, &["OBJECT", "ENCODING", "h2"]),
        b"$9\r\nhashtable\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c2, &["HLEN", "h2"]), b":5\r\n".to_vec());
}

#[test]
fn test_hincrby() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["HINCRBY", "h", "n", "5"]), b":5\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["HINCRBY", "h", "n", "-7"]), b":-2\r\n".to_vec());
    assert_eq!(
        run(&mut s, c, &["HINCRBYFLOAT", "h", "f", "1.5"]),
        b"$3\r\n1.5\r\n".to_vec()
    );
    run(&mut s, c, &["HSET", "h", "w", "abc"]);
    let out = run(&mut s, c, &["HINCRBY", "h", "w", "1"]);
    assert!(out.starts_with(b"-ERR hash value is not an integer"));
}

#[test]
fn test_hscan_covers_table() {
    let mut s = server();
    let c = s.mock_client();
    for i in 0..300 {
        let f = format!("field{i}");
        run(&mut s, c, &["HSET", "big", &f, "v"]);
    }
    let mut cursor = b"0".to_vec();
    let mut seen = std::collections::HashSet::new();
    loop {
        let out = run_owned(
            &mut s,
            c,
            vec![b"HSCAN".to_vec(), b"big".to_vec(), cursor.clone()],
        );
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.split("\r\n");
        assert_eq!(&lines.next().unwrap()[..1], "*");
        lines.next(); // $len of cursor
        cursor = lines.next().unwrap().as_bytes().to_vec();
        let mut items: Vec<&str> = Vec::new();
        lines.next(); // *2n header
        let mut rest: Vec<&str> = lines.collect();
        rest.retain(|l| !l.is_empty() && !l.starts_with('$'));
        items.extend(rest);
        for pair in items.chunks(2) {
            if pair.len() == 2 {
                seen.insert(pair[0].to_string());
            }
        }
        if cursor == b"0" {
            break;
        }
    }
    assert_eq!(seen.len(), 300);
}

#[test]
fn test_keys_and_scan() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MSET", "one", "1", "two", "2", "three", "3", "four", "4"]);
    let out = run(&mut s, c, &["KEYS", "t*"]);
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("*2\r\n"));
    assert!(text.contains("two"));
    assert!(text.contains("three"));
    // SCAN with a cursor loop must return every key at least once.
    let mut cursor = "0".to_string();
    let mut seen = std::collections::HashSet::new();
    loop {
        let out = run(&mut s, c, &["SCAN", &cursor, "COUNT", "2"]);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.split("\r\n");
        lines.next();
        lines.next();
        cursor = lines.next().unwrap().to_string();
        for l in lines {
            if !l.is_empty() && !l.starts_with('*') && !l.starts_with('$') {
                seen.insert(l.to_string());
            }
        }
        if cursor == "0" {
            break;
        }
    }
    assert_eq!(seen.len(), 4);
}

#[test]
fn test_exists_type_rename() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "a", "1"]);
    run(&mut s, c, &["RPUSH", "l", "x"]);
    assert_eq!(run(&mut s, c, &["EXISTS", "a", "l", "zz", "a"]), b":3\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["TYPE", "a"]), b"+string\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["TYPE", "l"]), b"+list\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["TYPE", "zz"]), b"+none\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["RENAME", "a", "b"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["GET", "b"]), b"$1\r\n1\r\n".to_vec());
    let out = run(&mut s, c, &["RENAME", "zz", "q"]);
    assert!(out.starts_with(b"-ERR no such key"));
    run(&mut s, c, &["SET", "c", "2"]);
    assert_eq!(run(&mut s, c, &["RENAMENX", "b", "c"]), b":0\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["RENAMENX", "b", "d"]), b":1\r\n".to_vec());
}

#[test]
fn test_select_move_swapdb() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "k", "v"]);
    assert_eq!(run(&mut s, c, &["MOVE", "k", "1"]), b":1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["EXISTS", "k"]), b":0\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["SELECT", "1"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$1\r\nv\r\n".to_vec());
    let out = run(&mut s, c, &["SELECT", "99"]);
    assert!(out.starts_with(b"-ERR DB index is out of range"));
    // swap db 1 (current) with db 0
    assert_eq!(run(&mut s, c, &["SWAPDB", "0", "1"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["EXISTS", "k"]), b":0\r\n".to_vec());
    run(&mut s, c, &["SELECT", "0"]);
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$1\r\nv\r\n".to_vec());
}

#[test]
fn test_flushdb_flushall() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MSET", "a", "1", "b", "2"]);
    run(&mut s, c, &["SELECT", "1"]);
    run(&mut s, c, &["SET", "x", "9"]);
    assert_eq!(run(&mut s, c, &["FLUSHDB"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["DBSIZE"]), b":0\r\n".to_vec());
    run(&mut s, c, &["SELECT", "0"]);
    assert_eq!(run(&mut s, c, &["DBSIZE"]), b":2\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["FLUSHALL", "ASYNC"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["DBSIZE"]), b":0\r\n".to_vec());
}

#[test]
fn test_expiration_visibility() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "k", "v"]);
    assert_eq!(run(&mut s, c, &["PEXPIRE", "k", "60000"]), b":1\r\n".to_vec());
    let out = run(&mut s, c, &["TTL", "k"]);
    assert!(out.starts_with(b":"), "ttl reply: {out:?}");
    // Still strictly before the deadline.
    let t0 = s.now_ms();
    s.clock.set_ms(t0 + 59_000);
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$1\r\nv\r\n".to_vec());
    // Past the deadline the key is invisible and physically gone.
    s.clock.set_ms(t0 + 61_000);
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$-1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["TTL", "k"]), b":-2\r\n".to_vec());
    assert!(s.dbs[0].peek(b"k").is_none(), "lazy expire deletes on access");
}

#[test]
fn test_expire_semantics() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["EXPIRE", "missing", "10"]), b":0\r\n".to_vec());
    run(&mut s, c, &["SET", "k", "v"]);
    assert_eq!(run(&mut s, c, &["TTL", "k"]), b":-1\r\n".to_vec());
    run(&mut s, c, &["EXPIRE", "k", "100"]);
    let out = run(&mut s, c, &["TTL", "k"]);
    assert!(out == b":100\r\n".to_vec() || out == b":99\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["PERSIST", "k"]), b":1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["TTL", "k"]), b":-1\r\n".to_vec());
    // Expiring with a past deadline deletes immediately.
    run(&mut s, c, &["EXPIRE", "k", "-1"]);
    assert_eq!(run(&mut s, c, &["EXISTS", "k"]), b":0\r\n".to_vec());
}

#[test]
fn test_active_expiration_cycle() {
    let mut s = server();
    let c = s.mock_client();
    for i in 0..200 {
        let k = format!("k{i}");
        run(&mut s, c, &["SET", &k, "v"]);
        run(&mut s, c, &["PEXPIRE", &k, "1000"]);
    }
    for i in 0..50 {
        let k = format!("live{i}");
        run(&mut s, c, &["SET", &k, "v"]);
    }
    assert_eq!(s.dbs[0].expires.len(), 200);
    let t0 = s.now_ms();
    s.clock.set_ms(t0 + 5_000);
    s.update_clock();
    // A few budgeted cycles drain the dead keys without touching live
    // ones; |expires| shrinks monotonically.
    let mut last = s.dbs[0].expires.len();
    for _ in 0..50 {
        s.active_expire_cycle(25);
        let now = s.dbs[0].expires.len();
        assert!(now <= last);
        last = now;
        if now == 0 {
            break;
        }
    }
    assert_eq!(s.dbs[0].expires.len(), 0);
    assert_eq!(s.dbs[0].len(), 50);
    assert!(s.stats.expired_keys >= 200);
}

#[test]
fn test_replica_masks_expired_without_deleting() {
    let mut s = server_with(Config { replica: true, ..Config::default() });
    // Replicas refuse writes, so plant state directly.
    let _ = s.dbs[0]
        .entries
        .insert(b"k", std::sync::Arc::new(ember::Object::string_from(b"v")));
    let t0 = s.now_ms();
    s.dbs[0].set_expire(b"k", t0 + 1000);
    s.clock.set_ms(t0 + 5_000);
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$-1\r\n".to_vec());
    // The entry is still physically there, waiting for the primary.
    assert!(s.dbs[0].peek(b"k").is_some());
    // And writes are refused.
    let out = run(&mut s, c, &["SET", "x", "1"]);
    assert!(out.starts_with(b"-READONLY"));
}

#[test]
fn test_randomkey_skips_expired() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["RANDOMKEY"]), b"$-1\r\n".to_vec());
    run(&mut s, c, &["SET", "live", "v"]);
    run(&mut s, c, &["SET", "dead", "v"]);
    run(&mut s, c, &["PEXPIRE", "dead", "10"]);
    let t0 = s.now_ms();
    s.clock.set_ms(t0 + 1_000);
    s.update_clock();
    for _ in 0..10 {
        assert_eq!(run(&mut s, c, &["RANDOMKEY"]), b"$4\r\nlive\r\n".to_vec());
    }
}

#[test]
fn test_multi_exec_basic() {
    let mut s = server();
    let c = s.mock_client();
    assert_eq!(run(&mut s, c, &["MULTI"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["SET", "k", "v"]), b"+QUEUED\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["INCR", "n"]), b"+QUEUED\r\n".to_vec());
    // Nothing ran yet.
    assert_eq!(s.dbs[0].len(), 0);
    assert_eq!(
        run(&mut s, c, &["EXEC"]),
        b"*2\r\n+OK\r\n:1\r\n".to_vec()
    );
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$1\r\nv\r\n".to_vec());
    // EXEC left the queuing state.
    let out = run(&mut s, c, &["EXEC"]);
    assert!(out.starts_with(b"-ERR EXEC without MULTI"));
}

#[test]
fn test_multi_discard() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["SET", "k", "v"]);
    assert_eq!(run(&mut s, c, &["DISCARD"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["EXISTS", "k"]), b":0\r\n".to_vec());
    let out = run(&mut s, c, &["DISCARD"]);
    assert!(out.starts_with(b"-ERR DISCARD without MULTI"));
}

#[test]
fn test_multi_queue_error_aborts_exec() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["SET", "k", "v"]);
    let out = run(&mut s, c, &["BOGUS", "x"]);
    assert!(out.starts_with(b"-ERR unknown command"));
    let out = run(&mut s, c, &["EXEC"]);
    assert!(out.starts_with(b"-EXECABORT"), "got {out:?}");
    assert_eq!(run(&mut s, c, &["EXISTS", "k"]), b":0\r\n".to_vec());
}

#[test]
fn test_watch_abort_on_foreign_write() {
    let mut s = server();
    let a = s.mock_client();
    let b = s.mock_client();
    run(&mut s, a, &["WATCH", "k"]);
    run(&mut s, a, &["MULTI"]);
    assert_eq!(run(&mut s, a, &["SET", "k", "v1"]), b"+QUEUED\r\n".to_vec());
    // Another connection touches the watched key.
    assert_eq!(run(&mut s, b, &["SET", "k", "other"]), b"+OK\r\n".to_vec());
    assert_eq!(run(&mut s, a, &["EXEC"]), b"*-1\r\n".to_vec());
    assert_eq!(run(&mut s, a, &["GET", "k"]), b"$5\r\nother\r\n".to_vec());
}

#[test]
fn test_watch_self_write_aborts() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["WATCH", "k"]);
    // The watcher itself modifies the key before MULTI.
    run(&mut s, c, &["SET", "k", "mine"]);
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["SET", "k", "queued"]);
    assert_eq!(run(&mut s, c, &["EXEC"]), b"*-1\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["GET", "k"]), b"$4\r\nmine\r\n".to_vec());
}

#[test]
fn test_unwatch_clears_abort() {
    let mut s = server();
    let a = s.mock_client();
    let b = s.mock_client();
    run(&mut s, a, &["WATCH", "k"]);
    run(&mut s, b, &["SET", "k", "other"]);
    run(&mut s, a, &["UNWATCH"]);
    run(&mut s, a, &["MULTI"]);
    run(&mut s, a, &["SET", "k", "v1"]);
    assert_eq!(run(&mut s, a, &["EXEC"]), b"*1\r\n+OK\r\n".to_vec());
    assert_eq!(run(&mut s, a, &["GET", "k"]), b"$2\r\nv1\r\n".to_vec());
}

#[test]
fn test_watch_expired_key_touch() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "k", "v"]);
    run(&mut s, c, &["PEXPIRE", "k", "1000"]);
    run(&mut s, c, &["WATCH", "k"]);
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["SET", "k", "new"]);
    // The key expires (lazily, via another client's read) before EXEC.
    let t0 = s.now_ms();
    s.clock.set_ms(t0 + 2_000);
    let other = s.mock_client();
    run(&mut s, other, &["GET", "k"]);
    assert_eq!(run(&mut s, c, &["EXEC"]), b"*-1\r\n".to_vec());
}

#[test]
fn test_watch_inside_multi_rejected() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MULTI"]);
    let out = run(&mut s, c, &["WATCH", "k"]);
    assert!(out.starts_with(b"-ERR WATCH inside MULTI is not allowed"));
    run(&mut s, c, &["DISCARD"]);
}

#[test]
fn test_exec_propagates_as_transaction() {
    let mut s = Server::with_propagator(
        Config::default(),
        Box::new(RecordingPropagator::default()),
    );
    let c = s.mock_client();
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["SET", "a", "1"]);
    run(&mut s, c, &["GET", "a"]);
    run(&mut s, c, &["SET", "b", "2"]);
    run(&mut s, c, &["EXEC"]);
    let rec = s.propagator.as_any().downcast_ref::<RecordingPropagator>().unwrap();
    let names: Vec<String> = rec
        .commands
        .iter()
        .map(|(_, argv, _)| String::from_utf8_lossy(&argv[0]).into_owned())
        .collect();
    // MULTI marker precedes the first write; EXEC closes the block; the
    // read propagates nothing.
    assert_eq!(names, vec!["multi", "set", "set", "exec"]);
}

#[test]
fn test_propagation_rewrites() {
    let mut s = Server::with_propagator(
        Config::default(),
        Box::new(RecordingPropagator::default()),
    );
    let c = s.mock_client();
    run(&mut s, c, &["SET", "k", "v", "EX", "100"]);
    run(&mut s, c, &["INCRBYFLOAT", "f", "1.5"]);
    run(&mut s, c, &["EXPIRE", "k", "50"]);
    let rec = s.propagator.as_any().downcast_ref::<RecordingPropagator>().unwrap();
    let argvs: Vec<Vec<String>> = rec
        .commands
        .iter()
        .map(|(_, argv, _)| {
            argv.iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect()
        })
        .collect();
    assert_eq!(argvs[0][0], "set");
    assert_eq!(argvs[0][3], "pxat", "relative expire must propagate absolute");
    assert_eq!(argvs[1], vec!["set", "f", "1.5"]);
    assert_eq!(argvs[2][0], "pexpireat");
}

#[test]
fn test_lazy_expire_propagates_del() {
    let mut s = Server::with_propagator(
        Config::default(),
        Box::new(RecordingPropagator::default()),
    );
    let c = s.mock_client();
    run(&mut s, c, &["SET", "k", "v"]);
    run(&mut s, c, &["PEXPIRE", "k", "100"]);
    let t0 = s.now_ms();
    s.clock.set_ms(t0 + 1_000);
    run(&mut s, c, &["GET", "k"]);
    let rec = s.propagator.as_any().downcast_ref::<RecordingPropagator>().unwrap();
    let last = rec.commands.last().unwrap();
    assert_eq!(last.1[0], b"del".to_vec());
    assert_eq!(last.1[1], b"k".to_vec());
}

#[test]
fn test_pubsub_basic_fanout() {
    let mut s = server();
    let publisher = s.mock_client();
    let x = s.mock_client();
    let y = s.mock_client();
    assert_eq!(
        run(&mut s, x, &["SUBSCRIBE", "news"]),
        b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n".to_vec()
    );
    run(&mut s, y, &["SUBSCRIBE", "news", "sports"]);
    assert_eq!(
        run(&mut s, publisher, &["PUBLISH", "news", "hi"]),
        b":2\r\n".to_vec()
    );
    assert_eq!(
        s.take_output(x),
        b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n".to_vec()
    );
    let out = s.take_output(y);
    assert!(out.ends_with(b"$2\r\nhi\r\n"));
    // Unsubscribed channel reaches nobody.
    assert_eq!(
        run(&mut s, publisher, &["PUBLISH", "empty", "x"]),
        b":0\r\n".to_vec()
    );
}

#[test]
fn test_pubsub_pattern_glob() {
    let mut s = server();
    let publisher = s.mock_client();
    let x = s.mock_client();
    assert_eq!(
        run(&mut s, x, &["PSUBSCRIBE", "news.*"]),
        b"*3\r\n$10\r\npsubscribe\r\n$6\r\nnews.*\r\n:1\r\n".to_vec()
    );
    assert_eq!(
        run(&mut s, publisher, &["PUBLISH", "news.weather", "hello"]),
        b":1\r\n".to_vec()
    );
    assert_eq!(
        s.take_output(x),
        b"*4\r\n$8\r\npmessage\r\n$6\r\nnews.*\r\n$12\r\nnews.weather\r\n$5\r\nhello\r\n"
            .to_vec()
    );
    // The dot matters: 'newsletter' does not match 'news.*'.
    assert_eq!(
        run(&mut s, publisher, &["PUBLISH", "newsletter", "hi"]),
        b":0\r\n".to_vec()
    );
    assert!(s.take_output(x).is_empty());
}

#[test]
fn test_pubsub_unsubscribe_variants() {
    let mut s = server();
    let c = s.mock_client();
    // Unsubscribing with no subscriptions still acknowledges once.
    assert_eq!(
        run(&mut s, c, &["UNSUBSCRIBE"]),
        b"*3\r\n$11\r\nunsubscribe\r\n$-1\r\n:0\r\n".to_vec()
    );
    // A pattern never subscribed still acknowledges.
    assert_eq!(
        run(&mut s, c, &["PUNSUBSCRIBE", "no.*"]),
        b"*3\r\n$12\r\npunsubscribe\r\n$4\r\nno.*\r\n:0\r\n".to_vec()
    );
    run(&mut s, c, &["SUBSCRIBE", "a", "b"]);
    let out = run(&mut s, c, &["UNSUBSCRIBE"]);
    // Two notifications, counts descending to zero.
    assert!(out.ends_with(b":0\r\n"));
    assert_eq!(s.pubsub.pattern_count(), 0);
}

#[test]
fn test_pubsub_introspection() {
    let mut s = server();
    let a = s.mock_client();
    let b = s.mock_client();
    run(&mut s, a, &["SUBSCRIBE", "news.tech"]);
    run(&mut s, b, &["SUBSCRIBE", "news.tech", "weather"]);
    run(&mut s, b, &["PSUBSCRIBE", "x.*"]);
    let probe = s.mock_client();
    let out = run(&mut s, probe, &["PUBSUB", "CHANNELS"]);
    assert!(out.starts_with(b"*2\r\n"));
    let out = run(&mut s, probe, &["PUBSUB", "CHANNELS", "news.*"]);
    assert!(out.starts_with(b"*1\r\n"));
    assert_eq!(
        run(&mut s, probe, &["PUBSUB", "NUMSUB", "news.tech", "nope"]),
        b"*4\r\n$9\r\nnews.tech\r\n:2\r\n$4\r\nnope\r\n:0\r\n".to_vec()
    );
    assert_eq!(run(&mut s, probe, &["PUBSUB", "NUMPAT"]), b":1\r\n".to_vec());
}

#[test]
fn test_subscriber_mode_restricts_commands() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SUBSCRIBE", "ch"]);
    let out = run(&mut s, c, &["GET", "k"]);
    assert!(out.starts_with(b"-ERR Can't execute 'get'"), "got {out:?}");
    // PING stays allowed.
    assert_eq!(run(&mut s, c, &["PING"]), b"+PONG\r\n".to_vec());
}

#[test]
fn test_blocking_pop_served_by_push() {
    let mut s = server();
    let blocked = s.mock_client();
    let pusher = s.mock_client();
    // Nothing there: the client parks without a reply.
    let out = run(&mut s, blocked, &["BLPOP", "q", "0"]);
    assert!(out.is_empty());
    assert!(s.client(blocked).unwrap().block.is_some());
    // A push from another client serves it FIFO.
    run(&mut s, pusher, &["RPUSH", "q", "job1"]);
    assert_eq!(
        s.take_output(blocked),
        b"*2\r\n$1\r\nq\r\n$4\r\njob1\r\n".to_vec()
    );
    assert!(s.client(blocked).unwrap().block.is_none());
    // The served element is consumed.
    assert_eq!(run(&mut s, pusher, &["EXISTS", "q"]), b":0\r\n".to_vec());
}

#[test]
fn test_blocking_pop_immediate_when_data() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["RPUSH", "q", "a", "b"]);
    assert_eq!(
        run(&mut s, c, &["BLPOP", "q", "5"]),
        b"*2\r\n$1\r\nq\r\n$1\r\na\r\n".to_vec()
    );
}

#[test]
fn test_blocking_pop_timeout() {
    let mut s = server();
    let c = s.mock_client();
    let out = run(&mut s, c, &["BLPOP", "q", "1"]);
    assert!(out.is_empty());
    // Simulate the loop timer firing.
    s.on_block_timeout(c);
    assert_eq!(s.take_output(c), b"*-1\r\n".to_vec());
    assert!(s.client(c).unwrap().block.is_none());
    // A late push finds no blocked client.
    let p = s.mock_client();
    run(&mut s, p, &["RPUSH", "q", "x"]);
    assert_eq!(run(&mut s, p, &["LLEN", "q"]), b":1\r\n".to_vec());
}

#[test]
fn test_brpoplpush_blocking_transfer() {
    let mut s = server();
    let consumer = s.mock_client();
    let producer = s.mock_client();
    let out = run(&mut s, consumer, &["BRPOPLPUSH", "src", "dst", "0"]);
    assert!(out.is_empty());
    run(&mut s, producer, &["RPUSH", "src", "task"]);
    assert_eq!(s.take_output(consumer), b"$4\r\ntask\r\n".to_vec());
    assert_eq!(
        run(&mut s, producer, &["LRANGE", "dst", "0", "-1"]),
        b"*1\r\n$4\r\ntask\r\n".to_vec()
    );
}

#[test]
fn test_blpop_multiple_waiters_fifo() {
    let mut s = server();
    let first = s.mock_client();
    let second = s.mock_client();
    let pusher = s.mock_client();
    run(&mut s, first, &["BLPOP", "q", "0"]);
    run(&mut s, second, &["BLPOP", "q", "0"]);
    run(&mut s, pusher, &["RPUSH", "q", "one"]);
    assert!(s.take_output(first).ends_with(b"$3\r\none\r\n"));
    assert!(s.take_output(second).is_empty());
    run(&mut s, pusher, &["RPUSH", "q", "two"]);
    assert!(s.take_output(second).ends_with(b"$3\r\ntwo\r\n"));
}

#[test]
fn test_blpop_inside_exec_never_blocks() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["BLPOP", "q", "0"]);
    assert_eq!(run(&mut s, c, &["EXEC"]), b"*1\r\n*-1\r\n".to_vec());
    assert!(s.client(c).unwrap().block.is_none());
}

#[test]
fn test_resp3_null_dialect() {
    let mut s = server();
    let c = s.mock_client();
    s.client_mut(c).unwrap().resp = 3;
    assert_eq!(run(&mut s, c, &["GET", "nope"]), b"_\r\n".to_vec());
    run(&mut s, c, &["WATCH", "k"]);
    let other = s.mock_client();
    run(&mut s, other, &["SET", "k", "x"]);
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["GET", "k"]);
    assert_eq!(run(&mut s, c, &["EXEC"]), b"_\r\n".to_vec());
}

#[test]
fn test_reset_restores_connection_state() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SELECT", "2"]);
    run(&mut s, c, &["SUBSCRIBE", "ch"]);
    assert_eq!(run(&mut s, c, &["RESET"]), b"+RESET\r\n".to_vec());
    let client = s.client(c).unwrap();
    assert_eq!(client.db_index, 0);
    assert!(!client.is_subscriber());
    assert_eq!(s.pubsub.subscriber_count(b"ch"), 0);
    // RESET also drops a pending MULTI.
    run(&mut s, c, &["MULTI"]);
    run(&mut s, c, &["RESET"]);
    let out = run(&mut s, c, &["EXEC"]);
    assert!(out.starts_with(b"-ERR EXEC without MULTI"));
}

#[test]
fn test_shutdown_latches() {
    let mut s = server();
    let c = s.mock_client();
    let out = run(&mut s, c, &["SHUTDOWN", "NOSAVE"]);
    assert!(out.is_empty());
    assert!(s.shutdown);
    assert!(s
        .actions
        .iter()
        .any(|a| matches!(a, ember::server::PostAction::Shutdown)));
}

#[test]
fn test_object_refcount_shared() {
    let mut s = server();
    let c = s.mock_client();
    run(&mut s, c, &["SET", "a", "100"]);
    run(&mut s, c, &["SET", "b", "100"]);
    let out = run(&mut s, c, &["OBJECT", "REFCOUNT", "a"]);
    let text = String::from_utf8(out).unwrap();
    let n: i64 = text[1..text.len() - 2].parse().unwrap();
    assert!(n >= 3, "shared integer refcount, got {n}");
}

#[test]
fn test_command_introspection() {
    let mut s = server();
    let c = s.mock_client();
    let out = run(&mut s, c, &["COMMAND", "COUNT"]);
    assert!(out.starts_with(b":"));
    assert_eq!(run(&mut s, c, &["ECHO", "hello"]), b"$5\r\nhello\r\n".to_vec());
    assert_eq!(run(&mut s, c, &["PING", "x"]), b"$1\r\nx\r\n".to_vec());
}

#[test]
fn test_dirty_counter_advances_on_writes_only() {
    let mut s = server();
    let c = s.mock_client();
    let d0 = s.dirty;
    run(&mut s, c, &["GET", "nope"]);
    assert_eq!(s.dirty, d0);
    run(&mut s, c, &["SET", "k", "v"]);
    assert!(s.dirty > d0);
}
