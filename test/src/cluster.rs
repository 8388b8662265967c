use std::sync::Arc;
use std::time::Duration;

use concord_context::{ContextBuilder, ContextConfig, ReplicatedContext};
use concord_shared::{MemberId, MembershipChange, Topic};

use crate::local_bus::{BusNetwork, LocalBus};
use crate::record::TestRecord;

/// The context type every harness node runs.
pub type TestContext = ReplicatedContext<String, TestRecord, LocalBus<String, TestRecord>>;

/// Topic shared by every node a [TestCluster] assembles.
pub const TOPIC: &str = "test-context";

/// A fully wired in-process cluster: `server_count` server-role nodes named
/// `server-N` and `client_count` client-role nodes named `client-N`, all on
/// one [BusNetwork].
pub struct TestCluster {
    pub network: Arc<BusNetwork<String, TestRecord>>,
    pub members: Vec<MemberId>,
    pub servers: Vec<TestContext>,
    pub clients: Vec<TestContext>,
}

fn test_config(client_role: bool) -> ContextConfig {
    ContextConfig {
        topic: TOPIC.to_string(),
        client_role,
        // Clients start empty and demand-fill.
        synchronize_on_start: !client_role,
        request_timeout: Duration::from_secs(2),
        update_lock_timeout: Duration::from_secs(5),
        sync_timeout: Duration::from_secs(5),
        ..ContextConfig::default()
    }
}

/// Assemble and start a cluster. The first server comes out as Main.
pub fn build_cluster(server_count: usize, client_count: usize) -> TestCluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = BusNetwork::new();
    let server_topic = Topic::new(TOPIC);
    let client_topic = server_topic.client_sub_topic();

    let mut members = Vec::new();
    let mut servers = Vec::new();
    let mut clients = Vec::new();

    // Register everyone before any context comes up, so receiver sets are
    // complete from the first event.
    for n in 1..=server_count {
        let member = MemberId::new(format!("server-{n}"));
        let bus = network.register(&member, std::slice::from_ref(&server_topic));
        let context: TestContext = ContextBuilder::new(bus)
            .with_config(test_config(false))
            .build();
        network.attach(&member, Arc::new(context.clone()));
        members.push(member);
        servers.push(context);
    }
    for n in 1..=client_count {
        let member = MemberId::new(format!("client-{n}"));
        let bus = network.register(&member, std::slice::from_ref(&client_topic));
        let context: TestContext = ContextBuilder::new(bus)
            .with_config(test_config(true))
            .build();
        network.attach(&member, Arc::new(context.clone()));
        members.push(member);
        clients.push(context);
    }

    let cluster = TestCluster {
        network,
        members,
        servers,
        clients,
    };
    cluster.announce_membership(&[]);
    for context in cluster.servers.iter().chain(&cluster.clients) {
        context.start().unwrap();
    }
    cluster
}

impl TestCluster {
    /// Deliver a membership transition from `old` to the current member list
    /// to every node.
    pub fn announce_membership(&self, old: &[MemberId]) {
        let change = MembershipChange::new(old.to_vec(), self.members.clone());
        for context in self.servers.iter().chain(&self.clients) {
            context.on_membership_changed(change.clone());
        }
    }

    /// Take `member` out of the cluster: partition it on the bus and deliver
    /// the shrunken view to everyone still in.
    pub fn remove_member(&mut self, member: &MemberId) {
        let old = self.members.clone();
        self.members.retain(|m| m != member);
        self.network.disconnect(member);
        self.servers
            .retain(|context| context.local_id() != *member);
        self.clients
            .retain(|context| context.local_id() != *member);
        let change = MembershipChange::new(old, self.members.clone());
        for context in self.servers.iter().chain(&self.clients) {
            context.on_membership_changed(change.clone());
        }
    }

    /// Wire a fresh server-role node into the running cluster and start it;
    /// startup pulls a snapshot from the current Main.
    pub fn add_server(&mut self, name: &str) -> TestContext {
        let member = MemberId::new(name);
        let server_topic = Topic::new(TOPIC);
        let bus = self
            .network
            .register(&member, std::slice::from_ref(&server_topic));
        let context: TestContext = ContextBuilder::new(bus)
            .with_config(test_config(false))
            .build();
        self.network.attach(&member, Arc::new(context.clone()));

        let old = self.members.clone();
        self.members.push(member);
        self.servers.push(context.clone());
        self.announce_membership(&old);
        context.start().unwrap();
        context
    }

    pub fn member(&self, name: &str) -> MemberId {
        MemberId::new(name)
    }

    /// The server context whose member id is `name`.
    pub fn server(&self, name: &str) -> &TestContext {
        self.servers
            .iter()
            .find(|context| context.local_id().as_str() == name)
            .expect("no such server")
    }
}
