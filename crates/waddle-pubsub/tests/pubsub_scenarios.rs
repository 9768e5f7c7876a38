//! End-to-end pub/sub scenarios through a running service actor.

mod common;

use common::*;
use minidom::Element;
use waddle_pubsub::PubSubStorage;

const ALICE: &str = "alice@example.com/desk";
const BOB: &str = "bob@example.com/home";

async fn with_news_node() -> TestService {
    let mut service = TestService::start();
    let (reply, _) = service
        .request(&iq("set", "create1", ALICE, &pubsub("<create node='news'/>")))
        .await;
    assert_eq!(reply.attr("type"), Some("result"));
    service
}

async fn subscribe_bob(service: &mut TestService) -> Element {
    let (reply, _) = service
        .request(&iq(
            "set",
            "sub1",
            BOB,
            &pubsub("<subscribe node='news' jid='bob@example.com'/>"),
        ))
        .await;
    reply
}

#[tokio::test]
async fn create_node_with_defaults() {
    let mut service = TestService::start();
    let (reply, _) = service
        .request(&iq("set", "create1", ALICE, &pubsub("<create node='news'/>")))
        .await;
    assert_eq!(reply.attr("type"), Some("result"));
    assert!(reply.get_child("pubsub", NS_PUBSUB).is_none());

    let (config, _) = service
        .request(&iq(
            "get",
            "cfg1",
            ALICE,
            &pubsub_owner("<configure node='news'/>"),
        ))
        .await;
    let form = config
        .get_child("pubsub", NS_PUBSUB_OWNER)
        .and_then(|p| p.get_child("configure", NS_PUBSUB_OWNER))
        .and_then(|c| c.get_child("x", "jabber:x:data"))
        .expect("configuration form");
    let value = |var: &str| {
        form.children()
            .find(|f| f.attr("var") == Some(var))
            .and_then(|f| f.get_child("value", "jabber:x:data"))
            .map(|v| v.text())
    };
    assert_eq!(value("pubsub#access_model").as_deref(), Some("open"));
    assert_eq!(value("pubsub#persist_items").as_deref(), Some("1"));
    assert_eq!(value("pubsub#max_items").as_deref(), Some("10"));

    service.stop().await;
}

#[tokio::test]
async fn subscribe_to_open_node() {
    let mut service = with_news_node().await;
    let reply = subscribe_bob(&mut service).await;

    assert_eq!(reply.attr("type"), Some("result"));
    let subscription = reply
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|p| p.get_child("subscription", NS_PUBSUB))
        .expect("subscription element");
    assert_eq!(subscription.attr("subscription"), Some("subscribed"));
    assert_eq!(subscription.attr("jid"), Some("bob@example.com"));

    let node_id = service
        .storage
        .get_node_id(&jid(SERVICE), "news")
        .await
        .expect("lookup")
        .expect("node exists");
    let affiliations = service
        .storage
        .get_node_affiliations(&jid(SERVICE), node_id)
        .await
        .expect("affiliations");
    let bob = affiliations
        .iter()
        .find(|a| a.jid == jid("bob@example.com"))
        .expect("bob persisted");
    assert_eq!(bob.affiliation.as_str(), "member");

    service.stop().await;
}

#[tokio::test]
async fn publish_notifies_subscribers_with_generated_id() {
    let mut service = with_news_node().await;
    subscribe_bob(&mut service).await;

    let (reply, notifications) = service
        .request(&iq(
            "set",
            "pub1",
            ALICE,
            &pubsub("<publish node='news'><item><entry xmlns='http://www.w3.org/2005/Atom'><title>Launch</title></entry></item></publish>"),
        ))
        .await;
    assert_eq!(reply.attr("type"), Some("result"));
    let id = reply
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|p| p.get_child("publish", NS_PUBSUB))
        .and_then(|p| p.get_child("item", NS_PUBSUB))
        .and_then(|i| i.attr("id"))
        .expect("generated id")
        .to_string();

    let node_id = service
        .storage
        .get_node_id(&jid(SERVICE), "news")
        .await
        .expect("lookup")
        .expect("node exists");
    let stored = service
        .storage
        .get_item(node_id, &id)
        .await
        .expect("lookup")
        .expect("item persisted");
    assert!(stored.data.contains("Launch"));

    assert_eq!(notifications.len(), 1);
    let event = &notifications[0];
    assert_eq!(event.name(), "message");
    assert_eq!(event.attr("to"), Some("bob@example.com"));
    let item = event
        .get_child("event", NS_PUBSUB_EVENT)
        .and_then(|e| e.get_child("items", NS_PUBSUB_EVENT))
        .and_then(|i| i.get_child("item", NS_PUBSUB_EVENT))
        .expect("event item");
    assert_eq!(item.attr("id"), Some(id.as_str()));

    service.stop().await;
}

#[tokio::test]
async fn only_owner_deletes_node() {
    let mut service = with_news_node().await;
    subscribe_bob(&mut service).await;

    let delete = pubsub_owner("<delete node='news'/>");
    let (denied, _) = service.request(&iq("set", "del1", BOB, &delete)).await;
    assert_eq!(denied.attr("type"), Some("error"));
    assert_eq!(error_condition(&denied).as_deref(), Some("forbidden"));
    assert!(service
        .storage
        .get_node_id(&jid(SERVICE), "news")
        .await
        .expect("lookup")
        .is_some());

    let (deleted, _) = service.request(&iq("set", "del2", ALICE, &delete)).await;
    assert_eq!(deleted.attr("type"), Some("result"));
    assert!(service
        .storage
        .get_node_id(&jid(SERVICE), "news")
        .await
        .expect("lookup")
        .is_none());

    let (lookup, _) = service
        .request(&iq("get", "items1", ALICE, &pubsub("<items node='news'/>")))
        .await;
    assert_eq!(error_condition(&lookup).as_deref(), Some("item-not-found"));

    service.stop().await;
}

#[tokio::test]
async fn authorize_node_keeps_subscription_pending() {
    let mut service = with_news_node().await;
    let configure = pubsub_owner(&format!(
        "<configure node='news'>{}</configure>",
        config_form(&[("pubsub#access_model", "authorize")])
    ));
    let (configured, _) = service.request(&iq("set", "cfg1", ALICE, &configure)).await;
    assert_eq!(configured.attr("type"), Some("result"));

    let (first, requests) = service
        .request(&iq(
            "set",
            "sub1",
            BOB,
            &pubsub("<subscribe node='news' jid='bob@example.com'/>"),
        ))
        .await;
    let subscription = first
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|p| p.get_child("subscription", NS_PUBSUB))
        .expect("subscription element");
    assert_eq!(subscription.attr("subscription"), Some("pending"));

    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.name(), "message");
    assert_eq!(request.attr("to"), Some("alice@example.com"));
    assert!(request.get_child("x", "jabber:x:data").is_some());

    let (second, _) = service
        .request(&iq(
            "set",
            "sub2",
            BOB,
            &pubsub("<subscribe node='news' jid='bob@example.com'/>"),
        ))
        .await;
    assert_eq!(error_condition(&second).as_deref(), Some("forbidden"));
    assert!(has_app_condition(&second, "pending-subscription"));

    service.stop().await;
}

#[tokio::test]
async fn whitelist_hides_items_from_strangers() {
    let mut service = with_news_node().await;
    let (published, _) = service
        .request(&iq(
            "set",
            "pub1",
            ALICE,
            &pubsub("<publish node='news'><item id='secret'><body xmlns='urn:example'>hidden</body></item></publish>"),
        ))
        .await;
    assert_eq!(published.attr("type"), Some("result"));

    let configure = pubsub_owner(&format!(
        "<configure node='news'>{}</configure>",
        config_form(&[("pubsub#access_model", "whitelist")])
    ));
    service.request(&iq("set", "cfg1", ALICE, &configure)).await;

    let (reply, _) = service
        .request(&iq("get", "items1", BOB, &pubsub("<items node='news'/>")))
        .await;
    assert_eq!(reply.attr("type"), Some("error"));
    assert_eq!(error_condition(&reply).as_deref(), Some("forbidden"));
    assert!(has_app_condition(&reply, "closed-node"));
    assert!(!String::from(&reply).contains("hidden"));

    service.stop().await;
}

#[tokio::test]
async fn owner_approves_pending_subscription() {
    let mut service = with_news_node().await;
    let configure = pubsub_owner(&format!(
        "<configure node='news'>{}</configure>",
        config_form(&[("pubsub#access_model", "authorize")])
    ));
    service.request(&iq("set", "cfg1", ALICE, &configure)).await;

    let (_, requests) = service
        .request(&iq(
            "set",
            "sub1",
            BOB,
            &pubsub("<subscribe node='news' jid='bob@example.com'/>"),
        ))
        .await;
    let form = requests[0]
        .get_child("x", "jabber:x:data")
        .expect("authorization form");
    let subid = form
        .children()
        .find(|f| f.attr("var") == Some("pubsub#subid"))
        .and_then(|f| f.get_child("value", "jabber:x:data"))
        .map(|v| v.text())
        .expect("subid");

    let approval = format!(
        "<message xmlns='jabber:client' id='auth1' from='{ALICE}' to='{SERVICE}'><x xmlns='jabber:x:data' type='submit'><field var='FORM_TYPE' type='hidden'><value>http://jabber.org/protocol/pubsub#subscribe_authorization</value></field><field var='pubsub#subid'><value>{subid}</value></field><field var='pubsub#node'><value>news</value></field><field var='pubsub#subscriber_jid'><value>bob@example.com</value></field><field var='pubsub#allow'><value>1</value></field></x></message>"
    );
    let sent = service.exchange(&approval).await;
    let notice = sent
        .iter()
        .find(|s| s.attr("to") == Some("bob@example.com"))
        .expect("subscriber told");
    let subscription = notice
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|p| p.get_child("subscription", NS_PUBSUB))
        .expect("subscription");
    assert_eq!(subscription.attr("subscription"), Some("subscribed"));

    service.stop().await;
}

#[tokio::test]
async fn service_discovery_lists_features() {
    let mut service = TestService::start();
    let (reply, _) = service
        .request(&iq(
            "get",
            "disco1",
            BOB,
            "<query xmlns='http://jabber.org/protocol/disco#info'/>",
        ))
        .await;
    let query = reply
        .get_child("query", "http://jabber.org/protocol/disco#info")
        .expect("disco#info");
    let identity = query
        .children()
        .find(|c| c.name() == "identity")
        .expect("identity");
    assert_eq!(identity.attr("category"), Some("pubsub"));
    assert_eq!(identity.attr("type"), Some("service"));
    assert_eq!(identity.attr("name"), Some("Publish-Subscribe"));
    let features: Vec<_> = query
        .children()
        .filter(|c| c.name() == "feature")
        .filter_map(|c| c.attr("var"))
        .collect();
    assert!(features.contains(&"http://jabber.org/protocol/pubsub#subscription-notifications"));

    service.stop().await;
}
