//! 测试公共工具：模拟的子连接与连接管理方

#![allow(dead_code)]

use flare_registry::balancer::{Address, BalancerState, ClientConn, ConnectivityState, SubConn, SubConnId};
use flare_registry::registry::Endpoints;
use flare_registry::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct MockSubConn {
    pub id: SubConnId,
    pub addr: String,
    pub connects: AtomicUsize,
}

impl SubConn for MockSubConn {
    fn id(&self) -> SubConnId {
        self.id
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockClientConn {
    next_id: AtomicU64,
    pub created: Mutex<Vec<Arc<MockSubConn>>>,
    pub removed: Mutex<Vec<String>>,
    pub published: Mutex<Vec<ConnectivityState>>,
}

impl MockClientConn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 地址对应的最新子连接
    pub fn sub_conn(&self, addr: &str) -> Arc<dyn SubConn> {
        let found = self
            .created
            .lock()
            .iter()
            .rev()
            .find(|sc| sc.addr == addr)
            .cloned()
            .unwrap_or_else(|| panic!("no sub connection for {addr}"));
        found
    }

    pub fn mock(&self, addr: &str) -> Arc<MockSubConn> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|sc| sc.addr == addr)
            .cloned()
            .unwrap_or_else(|| panic!("no sub connection for {addr}"))
    }

    pub fn created_addrs(&self) -> Vec<String> {
        self.created.lock().iter().map(|sc| sc.addr.clone()).collect()
    }

    pub fn removed_addrs(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn last_published(&self) -> Option<ConnectivityState> {
        self.published.lock().last().copied()
    }
}

impl ClientConn for MockClientConn {
    fn new_sub_conn(&self, address: &Address) -> Result<Arc<dyn SubConn>> {
        let sub_conn = Arc::new(MockSubConn {
            id: SubConnId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            addr: address.addr.clone(),
            connects: AtomicUsize::new(0),
        });
        self.created.lock().push(sub_conn.clone());
        Ok(sub_conn)
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        self.removed.lock().push(sub_conn.addr().to_string());
    }

    fn update_state(&self, state: BalancerState) {
        self.published.lock().push(state.state);
    }
}

pub fn addresses(addrs: &[&str]) -> Vec<Address> {
    addrs.iter().map(|a| Address::new(*a)).collect()
}

/// 等待满足条件的快照
pub async fn wait_for_endpoints<F>(
    rx: &mut mpsc::Receiver<Endpoints>,
    within: Duration,
    mut predicate: F,
) -> Endpoints
where
    F: FnMut(&Endpoints) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            let endpoints = rx.recv().await.expect("watch channel closed");
            if predicate(&endpoints) {
                return endpoints;
            }
        }
    })
    .await
    .expect("timed out waiting for endpoints")
}

/// 轮询直到条件成立
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
