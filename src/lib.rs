pub mod core;
pub mod query;
pub mod storage;
pub mod search;

/*
┌──────────────────────────────────────────────────────────────────────────────────┐
│                           RYFTGATE QUERY PIPELINE                                 │
└──────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── QUERY LAYER ─────────────────────────────────────┐
│                                                                                   │
│   "hello AND (RECORD.id CONTAINS DATE(MM/DD/YY > 02/28/12))"                       │
│        │                                                                          │
│        ▼                                                                          │
│  ┌─────────────┐     ┌─────────────┐     ┌──────────────────────────────────┐    │
│  │ Scanner     │ ──▶ │ Parser      │ ──▶ │ Optimizer                        │    │
│  │ • Lexeme    │     │ • Query     │     │ • fuses leaves into one backend  │    │
│  │ • Token     │     │ • Options   │     │   expression (combine_limit)     │    │
│  └─────────────┘     └─────────────┘     └──────────────────────────────────┘    │
└───────────────────────────────────────────────────────────────────────────────────┘
                                     │ Query tree
                                     ▼
┌──────────────────────────────── SEARCH LAYER ────────────────────────────────────┐
│                                                                                   │
│  ┌──────────────────────┐        ┌──────────────────────────────────────────┐    │
│  │ Coordinator          │ ─────▶ │ remote peers: GET /search (NDJSON)       │    │
│  │ • PartitionMap       │        └──────────────────────────────────────────┘    │
│  │ • ServiceDirectory   │                                                         │
│  └──────────┬───────────┘                                                         │
│             ▼                                                                     │
│  ┌──────────────────────┐   leaf   ┌───────────────────┐   argv   ┌──────────┐   │
│  │ Scheduler            │ ───────▶ │ Backend           │ ───────▶ │ ryftprim │   │
│  │ • AND chain / OR     │          │ • Tweaks routing  │          │ ryftx .. │   │
│  │ • Scratch files      │          └───────────────────┘          └────┬─────┘   │
│  └──────────┬───────────┘                                                │         │
│             │                        INDEX + DATA files ◀────────────────┘         │
│             ▼                                                                     │
│  ┌──────────────────────┐          ┌───────────────────────────────────────┐     │
│  │ TailReaders          │          │ ResultStore                           │     │
│  │ • IndexReader ──────▶│ bounded  │ • intermediate DATA → source unwind   │     │
│  │ • DataReader         │ channel  │ • sort, dedup, limit, keep_*_as       │     │
│  └──────────┬───────────┘          └───────────────────┬───────────────────┘     │
│             └──────────────────┬───────────────────────┘                         │
│                                ▼                                                  │
│                  ResultSink ──▶ ResultStream (Record | Error | Stat)              │
└───────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── STORAGE LAYER ───────────────────────────────────┐
│  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐  ┌──────────────┐  │
│  │ VIEW file        │  │ ScratchLayout    │  │ Catalog      │  │ FileLock     │  │
│  │ • 64 byte header │  │ • .temp-dat-*    │  │ • header     │  │ • flock      │  │
│  │ • 32 byte items  │  │ • .temp-idx-*    │  │ • append     │  │              │  │
│  └──────────────────┘  └──────────────────┘  └──────────────┘  └──────────────┘  │
└───────────────────────────────────────────────────────────────────────────────────┘
*/
