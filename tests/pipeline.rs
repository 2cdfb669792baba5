use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use booru_index::clock::{ManualClock, SystemClock};
use booru_index::db::{MemoryStore, Op, QueuedImage, Rating, RecordStore, Store, keys};
use booru_index::http::{HttpFetch, Response};
use booru_index::imhash;
use booru_index::queue::{CRAWL_QUEUE, INDEX_QUEUE, Job, JobQueue, MemoryJobQueue};
use booru_index::scraper::{self, CrawlConfig, CrawlRequest, Crawler, Danbooru, SiteAdapter, SiteRegistry};
use booru_index::worker::{ProcessOutcome, WorkerConfig, WorkerContext};
use booru_index::{Error, Result};
use futures::StreamExt;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rstest::*;

const BOORU: &str = "http://booru.test";

/// 按 URL 返回预设响应，同一 URL 有多个响应时依次返回，最后一个重复使用
#[derive(Default)]
struct MockHttp {
    routes: Mutex<HashMap<String, Vec<Response>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MockHttp {
    fn route(&self, url: &str, responses: Vec<Response>) {
        self.routes.lock().unwrap().insert(url.to_string(), responses);
    }

    fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HttpFetch for MockHttp {
    async fn fetch(&self, url: &str) -> Result<Response> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let mut routes = self.routes.lock().unwrap();
        let resp = match routes.get_mut(url) {
            Some(responses) if responses.len() > 1 => responses.remove(0),
            Some(responses) => responses[0].clone(),
            None => status(404),
        };
        Ok(resp)
    }
}

/// 永远不会返回的下载
struct HangingHttp;

#[async_trait]
impl HttpFetch for HangingHttp {
    async fn fetch(&self, _url: &str) -> Result<Response> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(status(200))
    }
}

fn status(status: u16) -> Response {
    Response { status, body: vec![] }
}

fn ok(body: impl Into<Vec<u8>>) -> Response {
    Response { status: 200, body: body.into() }
}

fn png(img: DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(vec![]);
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn horizontal() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, _| Luma([(x * 4) as u8])))
}

fn vertical() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |_, y| Luma([(y * 4) as u8])))
}

fn queued(site: &str, source_id: &str, url: &str) -> QueuedImage {
    QueuedImage {
        source_site: site.to_string(),
        source_id: source_id.to_string(),
        source_url: url.to_string(),
        characters: BTreeSet::from(["miku".to_string()]),
        sfw_rating: Rating::Safe,
        authors: BTreeSet::new(),
        source_tags: BTreeSet::new(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
    http: Arc<MockHttp>,
    ctx: WorkerContext,
}

impl Harness {
    fn context(&self) -> WorkerContext {
        context(self.store.clone(), self.queue.clone(), self.http.clone())
    }

    async fn indexed(&self) -> usize {
        self.store.smembers(keys::IMAGES.as_bytes()).await.unwrap().len()
    }

    fn records(&self) -> RecordStore {
        RecordStore::new(self.store.clone())
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        job_delay: Duration::ZERO,
        retry_backoff: Duration::ZERO,
        crawl: CrawlConfig { page_delay: Duration::ZERO, max_retries: 2, ..CrawlConfig::default() },
        ..WorkerConfig::default()
    }
}

fn context(store: Arc<MemoryStore>, queue: Arc<MemoryJobQueue>, http: Arc<dyn HttpFetch>) -> WorkerContext {
    let sites = SiteRegistry::new().register(Arc::new(Danbooru::new(BOORU)));
    WorkerContext::new(store, queue, http, Arc::new(SystemClock), config()).with_sites(sites)
}

#[fixture]
fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let http = Arc::new(MockHttp::default());
    http.route("http://cdn.test/1.png", vec![ok(png(horizontal()))]);
    http.route(
        "http://cdn.test/2.png",
        vec![ok(png(horizontal().resize_exact(48, 48, FilterType::Triangle)))],
    );
    http.route("http://cdn.test/3.png", vec![ok(png(vertical()))]);
    let ctx = context(store.clone(), queue.clone(), http.clone());
    Harness { store, queue, http, ctx }
}

fn page_url(page: u32) -> String {
    format!("{BOORU}/posts.json?page={page}&limit=200&tags=hatsune_miku")
}

const FIRST_PAGE: &str = r#"[
    {"id": 1, "tag_string": "hatsune_miku vocaloid", "tag_string_artist": "art1", "rating": "s", "file_url": "http://cdn.test/1.png"},
    {"id": 4, "tag_string": "hatsune_miku guro", "tag_string_artist": "", "rating": "e", "file_url": "http://cdn.test/4.png"},
    {"id": 5, "tag_string": "hatsune_miku", "tag_string_artist": "", "rating": "s", "file_url": "http://cdn.test/5.webm"},
    {"id": 6, "tag_string": "hatsune_miku", "tag_string_artist": "", "rating": "q"},
    {"id": 3, "tag_string": "hatsune_miku", "tag_string_artist": "art2", "rating": "q", "large_file_url": "http://cdn.test/3.png"}
]"#;

#[rstest]
#[tokio::test]
async fn crawl_then_index(harness: Harness) {
    harness.http.route(&page_url(1), vec![ok(FIRST_PAGE)]);
    harness.http.route(&page_url(2), vec![ok("[]")]);

    let adapter = harness.ctx.sites.get("danbooru").unwrap();
    scraper::associate_tag(harness.store.as_ref(), adapter.as_ref(), "miku", "hatsune_miku").await.unwrap();

    let job = Job::DoIndexingCrawl { site: "danbooru".into(), character: "miku".into() };
    harness.queue.enqueue(&job).await.unwrap();
    assert_eq!(harness.ctx.drain(CRAWL_QUEUE, 0).await.unwrap(), 1);
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 2);
    assert_eq!(harness.http.hits(&page_url(3)), 0);

    assert_eq!(harness.ctx.drain(INDEX_QUEUE, 0).await.unwrap(), 2);
    assert_eq!(harness.indexed().await, 2);
    assert_eq!(harness.queue.in_flight(INDEX_QUEUE).await, 0);

    let records = harness.records();
    let ids = records.character_images("miku").await.unwrap();
    assert_eq!(ids.len(), 2);
    let first = records.get(ids[0]).await.unwrap();
    let second = records.get(ids[1]).await.unwrap();
    let (post1, post3) = if first.source_id() == "1" { (&first, &second) } else { (&second, &first) };

    assert_eq!(post1.source_url(), "http://cdn.test/1.png");
    assert_eq!(post1.authors(), &BTreeSet::from(["art1".to_string()]));
    assert!(post1.source_tags().contains("vocaloid"));
    assert_eq!(post1.sfw_rating(), Rating::Safe);
    assert_eq!(post3.sfw_rating(), Rating::Questionable);
    assert_eq!(harness.http.hits("http://cdn.test/4.png"), 0);
}

#[rstest]
#[tokio::test]
async fn new_image_is_indexed_everywhere(harness: Harness) {
    let data = png(horizontal());
    harness.http.route("http://cdn.test/a.png", vec![ok(data.clone())]);
    let image = QueuedImage {
        authors: BTreeSet::from(["art1".to_string()]),
        source_tags: BTreeSet::from(["vocaloid".to_string()]),
        ..queued("danbooru", "1", "http://cdn.test/a.png")
    };

    let outcome = harness.ctx.process_queued_image(0, &image).await.unwrap();
    let ProcessOutcome::New(id) = outcome else {
        panic!("expected a new image, got {outcome:?}");
    };
    let record = harness.records().get(id).await.unwrap();
    assert_eq!(record.imhash, imhash::fingerprint_bytes(&data).unwrap());
    assert_eq!(record.queued, image);

    let member = id.to_string().into_bytes();
    let characters = harness.store.zrange_withscores(keys::character("miku").as_bytes()).await.unwrap();
    assert!(characters.iter().any(|(m, _)| *m == member));
    for key in [keys::rating("safe"), keys::site("danbooru")] {
        assert!(harness.store.smembers(key.as_bytes()).await.unwrap().contains(&member), "{key}");
    }

    let again = queued("gelbooru", "2", "http://cdn.test/a.png");
    assert_eq!(harness.ctx.process_queued_image(1, &again).await.unwrap(), ProcessOutcome::Duplicate(id));
    let aliases = harness.records().aliases(id).await.unwrap();
    assert_eq!(aliases, BTreeSet::from(["danbooru#1".to_string(), "gelbooru#2".to_string()]));
    assert_eq!(harness.indexed().await, 1);
}

#[rstest]
#[tokio::test]
async fn claimed_fingerprint_is_not_overwritten(harness: Harness) {
    let fp = imhash::fingerprint_bytes(&png(horizontal())).unwrap();
    let claimed = keys::imhash(fp.as_bytes());
    harness.store.exec(vec![Op::set(claimed.clone(), "42")]).await.unwrap();

    let outcome = harness.ctx.process_queued_image(0, &queued("danbooru", "1", "http://cdn.test/1.png")).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert_eq!(harness.store.get(&claimed).await.unwrap(), Some(b"42".to_vec()));
    assert_eq!(harness.indexed().await, 0);
}

#[rstest]
#[tokio::test]
async fn near_duplicate_on_another_site(harness: Harness) {
    let original = harness.ctx.process_queued_image(0, &queued("danbooru", "1", "http://cdn.test/1.png")).await.unwrap();
    let ProcessOutcome::New(id) = original else {
        panic!("expected a new image, got {original:?}");
    };

    let dup = queued("gelbooru", "2", "http://cdn.test/2.png");
    let outcome = harness.ctx.process_queued_image(1, &dup).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Duplicate(id));

    let aliases = harness.records().aliases(id).await.unwrap();
    assert_eq!(aliases, BTreeSet::from(["danbooru#1".to_string(), "gelbooru#2".to_string()]));
    assert_eq!(harness.indexed().await, 1);

    let other = harness.ctx.process_queued_image(0, &queued("danbooru", "3", "http://cdn.test/3.png")).await.unwrap();
    assert!(matches!(other, ProcessOutcome::New(other_id) if other_id != id));
    assert_eq!(harness.indexed().await, 2);
}

#[rstest]
#[tokio::test]
async fn same_source_is_indexed_once(harness: Harness) {
    let image = queued("danbooru", "1", "http://cdn.test/1.png");
    assert!(matches!(harness.ctx.process_queued_image(0, &image).await.unwrap(), ProcessOutcome::New(_)));
    assert_eq!(harness.ctx.process_queued_image(0, &image).await.unwrap(), ProcessOutcome::Skipped);
    assert_eq!(harness.http.hits("http://cdn.test/1.png"), 1);
    assert_eq!(harness.indexed().await, 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_is_indexed_once(harness: Harness) {
    let image = queued("danbooru", "1", "http://cdn.test/1.png");
    let a = harness.context();
    let b = harness.context();
    let (ra, rb) = tokio::join!(a.process_queued_image(1, &image), b.process_queued_image(2, &image));

    let outcomes = [ra.unwrap(), rb.unwrap()];
    let created = outcomes.iter().filter(|o| matches!(o, ProcessOutcome::New(_))).count();
    assert_eq!(created, 1, "{outcomes:?}");
    assert_eq!(harness.indexed().await, 1);

    let id = harness.records().character_images("miku").await.unwrap()[0];
    assert_eq!(harness.records().aliases(id).await.unwrap(), BTreeSet::from(["danbooru#1".to_string()]));
}

#[rstest]
#[tokio::test]
async fn failed_download_is_redelivered(harness: Harness) {
    let url = "http://cdn.test/flaky.png";
    harness.http.route(url, vec![status(500), ok(png(horizontal()))]);
    harness.queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "9", url))).await.unwrap();

    assert!(harness.ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 1);
    assert_eq!(harness.indexed().await, 0);

    assert!(harness.ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 0);
    assert_eq!(harness.queue.in_flight(INDEX_QUEUE).await, 0);
    assert_eq!(harness.indexed().await, 1);
    assert!(!harness.ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
}

#[rstest]
#[tokio::test]
async fn broken_url_is_abandoned(harness: Harness) {
    let gone = "http://cdn.test/gone.png";
    harness.queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "7", gone))).await.unwrap();
    harness.queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "1", "http://cdn.test/1.png"))).await.unwrap();

    assert_eq!(harness.ctx.drain(INDEX_QUEUE, 0).await.unwrap(), 4);
    assert_eq!(harness.http.hits(gone), 3);
    assert_eq!(harness.indexed().await, 1);
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 0);
    assert_eq!(harness.queue.in_flight(INDEX_QUEUE).await, 0);
}

#[rstest]
#[tokio::test]
async fn job_delay_applies_after_failure(harness: Harness) {
    let config = WorkerConfig { job_delay: Duration::from_millis(30), ..config() };
    let ctx = WorkerContext::new(harness.store.clone(), harness.queue.clone(), harness.http.clone(), Arc::new(SystemClock), config);
    harness.queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "7", "http://cdn.test/gone.png"))).await.unwrap();

    let start = std::time::Instant::now();
    assert!(ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[rstest]
#[tokio::test]
async fn undecodable_image_is_dropped(harness: Harness) {
    let url = "http://cdn.test/broken.png";
    harness.http.route(url, vec![ok("not a png")]);
    harness.queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "8", url))).await.unwrap();

    assert!(harness.ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 0);
    assert_eq!(harness.queue.in_flight(INDEX_QUEUE).await, 0);
    assert_eq!(harness.indexed().await, 0);
}

#[rstest]
#[tokio::test]
async fn unknown_site_job_is_dropped(harness: Harness) {
    let job = Job::DoIndexingCrawl { site: "pixiv".into(), character: "miku".into() };
    harness.queue.enqueue(&job).await.unwrap();
    assert_eq!(harness.ctx.drain(CRAWL_QUEUE, 0).await.unwrap(), 1);
    assert_eq!(harness.queue.in_flight(CRAWL_QUEUE).await, 0);
}

#[rstest]
#[tokio::test]
async fn crawl_aborts_after_retries(harness: Harness) {
    harness.http.route(&page_url(1), vec![status(500)]);

    let adapter = harness.ctx.sites.get("danbooru").unwrap();
    let request = CrawlRequest {
        character: "miku".to_string(),
        terms: adapter.search_terms("hatsune_miku").unwrap(),
        start_id: None,
    };
    let crawler = Crawler::new(adapter, harness.http.clone(), config().crawl);
    let items = crawler.crawl(request).collect::<Vec<_>>().await;

    assert_eq!(items.len(), 1);
    assert!(matches!(&items[0], Err(Error::CrawlAborted { page: 0, .. })));
    assert_eq!(harness.http.hits(&page_url(1)), 3);
}

#[rstest]
#[tokio::test]
async fn aborted_crawl_keeps_earlier_pages(harness: Harness) {
    harness.http.route(&page_url(1), vec![ok(FIRST_PAGE)]);
    harness.http.route(&page_url(2), vec![status(503)]);

    let adapter = harness.ctx.sites.get("danbooru").unwrap();
    scraper::associate_tag(harness.store.as_ref(), adapter.as_ref(), "miku", "hatsune_miku").await.unwrap();

    assert_eq!(harness.ctx.do_indexing_crawl("danbooru", "miku").await.unwrap(), 2);
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 2);
}

#[rstest]
#[tokio::test]
async fn crawl_without_association(harness: Harness) {
    assert_eq!(harness.ctx.do_indexing_crawl("danbooru", "miku").await.unwrap(), 0);
    assert_eq!(harness.queue.pending(INDEX_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn timed_out_job_stays_leased() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::with_clock(clock.clone()));
    let config = WorkerConfig { job_timeout: Duration::from_millis(50), ..config() };
    let ctx = WorkerContext::new(store, queue.clone(), Arc::new(HangingHttp), clock.clone(), config.clone());

    queue.enqueue(&Job::ProcessQueuedImage(queued("danbooru", "1", "http://cdn.test/1.png"))).await.unwrap();
    assert!(ctx.run_once(INDEX_QUEUE, 0).await.unwrap());
    assert_eq!(queue.pending(INDEX_QUEUE).await.unwrap(), 0);
    assert_eq!(queue.in_flight(INDEX_QUEUE).await, 1);

    clock.advance(config.lease().as_millis() as i64);
    assert_eq!(queue.reclaim_expired(INDEX_QUEUE).await.unwrap(), 1);
    assert_eq!(queue.pending(INDEX_QUEUE).await.unwrap(), 1);
}

#[rstest]
#[tokio::test]
async fn cache_saved_image(harness: Harness) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = harness.context().with_cache(Some(booru_index::cache::ImageCache::new(dir.path())));

    let outcome = ctx.process_queued_image(0, &queued("danbooru", "1", "http://cdn.test/1.png")).await.unwrap();
    let ProcessOutcome::New(id) = outcome else {
        panic!("expected a new image, got {outcome:?}");
    };
    assert!(dir.path().join(format!("{id}.png")).exists());
    assert!(!ctx.cache_saved_image(id).await.unwrap());

    std::fs::remove_file(dir.path().join(format!("{id}.png"))).unwrap();
    assert!(ctx.cache_saved_image(id).await.unwrap());
    assert!(matches!(ctx.cache_saved_image(404).await, Err(Error::NotFound(404))));
}
