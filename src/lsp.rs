//! The language server transport: a `tower-lsp-server` `Backend` wrapping
//! the same `Compiler`/`SourceProvider` the CLI drives — version-guarded
//! debounce, a version map tracking open-buffer versions, and a detached
//! debounce task per edit. Typedown recompiles the *whole project* per
//! debounce window rather than one file, since the validator's global
//! stage needs every document anyway, with a 500ms debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tower_lsp_server::jsonrpc::Result as RpcResult;
use tower_lsp_server::ls_types::*;
use tower_lsp_server::{Client, LanguageServer, LspService, Server};

use crate::diagnostic::{Diagnostic as TdDiagnostic, DiagnosticReport, Level};
use crate::identifier::Identifier;
use crate::project::{CompileOptions, Compiler, Project, Stage};
use crate::query::QueryEngine;
use crate::symbol_table::Resolved;

const DEBOUNCE: Duration = Duration::from_millis(500);

fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    uri.to_file_path().map(|p| PathBuf::from(p.as_ref()))
}

fn path_to_uri(path: &Path) -> Option<Uri> {
    Uri::from_str(&format!("file://{}", path.display())).ok()
}

/// `typedown/loadProject`: bulk-hydrates the in-memory overlay and replaces
/// the project root in one shot, for editors that want to hand the whole
/// workspace to the server without touching disk.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProjectParams {
    /// New project root. Defaults to the server's current root when absent,
    /// so a client can send just `{ files }` and still rehydrate in place.
    #[serde(default)]
    pub root: Option<String>,
    pub files: HashMap<String, String>,
}

/// `typedown/resetFileSystem`: drops every overlay entry, reverting to disk
/// content everywhere.
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ResetFileSystemParams {}

/// `typedown/updateFile`: a single-file overlay update outside the normal
/// `textDocument/didChange` flow (editors without an open buffer for the
/// file, e.g. a generated file panel).
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileParams {
    pub uri: String,
    pub content: String,
}

/// Typedown's language server backend. Holds one `Compiler` behind a lock,
/// rebuilt wholesale by `typedown/loadProject`; day-to-day edits just touch
/// its `SourceProvider` overlay and trigger a debounced whole-project
/// recompile — there is no incremental per-file queue.
pub struct Backend {
    client: Client,
    compiler: Arc<Mutex<Compiler>>,
    /// Open buffers: uri -> lsp version, so a debounce task spawned for an
    /// older version can detect it has been superseded and discard itself.
    document_versions: Arc<Mutex<HashMap<Uri, i32>>>,
    /// Files touched by the most recent publish, so the next publish can
    /// clear diagnostics for files that are no longer open or no longer
    /// report anything.
    last_published: Arc<Mutex<Vec<PathBuf>>>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        let project = Project::memory(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        Backend {
            client,
            compiler: Arc::new(Mutex::new(Compiler::in_memory(project))),
            document_versions: Arc::new(Mutex::new(HashMap::new())),
            last_published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns a debounce task for `uri`, capturing its current version so a
    /// later, faster edit can make this task a no-op.
    fn spawn_debounced_compile(&self, uri: Uri) {
        let spawn_version = match self.document_versions.lock().get(&uri) {
            Some(v) => *v,
            None => 0,
        };
        let client = self.client.clone();
        let compiler = Arc::clone(&self.compiler);
        let versions = Arc::clone(&self.document_versions);
        let last_published = Arc::clone(&self.last_published);
        let uri_for_check = uri;

        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;

            let still_current = versions
                .lock()
                .get(&uri_for_check)
                .map(|v| *v == spawn_version)
                .unwrap_or(true);
            if !still_current {
                return;
            }

            let (report, touched) = {
                let compiler = compiler.lock();
                let result = compiler.compile(&CompileOptions::default());
                let touched: Vec<PathBuf> =
                    result.store.documents().map(|d| d.path.clone()).collect();
                (result.diagnostics, touched)
            };

            publish_report(&client, &report, &touched, &last_published).await;
        });
    }

    /// Compiles immediately (no debounce) and publishes. Used for bulk
    /// hand-offs (`initialized`, `loadProject`, `resetFileSystem`) where
    /// there is no single edit to debounce against.
    async fn compile_and_publish_now(&self) {
        let (report, touched) = {
            let compiler = self.compiler.lock();
            let result = compiler.compile(&CompileOptions::default());
            let touched: Vec<PathBuf> = result.store.documents().map(|d| d.path.clone()).collect();
            (result.diagnostics, touched)
        };
        publish_report(&self.client, &report, &touched, &self.last_published).await;
    }
}

async fn publish_report(
    client: &Client,
    report: &DiagnosticReport,
    touched: &[PathBuf],
    last_published: &Mutex<Vec<PathBuf>>,
) {
    for path in touched {
        let Some(uri) = path_to_uri(path) else {
            continue;
        };
        let diagnostics = report
            .for_file(path)
            .into_iter()
            .map(td_diagnostic_to_lsp)
            .collect();
        client.publish_diagnostics(uri, diagnostics, None).await;
    }

    let mut previous = last_published.lock();
    for stale in previous.iter().filter(|p| !touched.contains(p)) {
        if let Some(uri) = path_to_uri(stale) {
            client.publish_diagnostics(uri, vec![], None).await;
        }
    }
    *previous = touched.to_vec();
}

fn td_diagnostic_to_lsp(diag: &TdDiagnostic) -> Diagnostic {
    let severity = Some(match diag.level {
        Level::Error => DiagnosticSeverity::ERROR,
        Level::Warning => DiagnosticSeverity::WARNING,
        Level::Info => DiagnosticSeverity::INFORMATION,
        Level::Hint => DiagnosticSeverity::HINT,
    });

    let range = match &diag.location {
        Some(loc) => Range::new(
            Position::new((loc.line_start.saturating_sub(1)) as u32, loc.col_start as u32),
            Position::new((loc.line_end.saturating_sub(1)) as u32, loc.col_end as u32),
        ),
        None => Range::new(Position::new(0, 0), Position::new(0, 0)),
    };

    Diagnostic {
        range,
        severity,
        code: Some(NumberOrString::String(diag.code.as_str().to_string())),
        source: Some("typedown".to_string()),
        message: diag.message.clone(),
        ..Default::default()
    }
}

/// Finds a `[[...]]` span covering byte offset `offset` in `text`, returning
/// the inner identifier text.
fn reference_at_offset(text: &str, offset: usize) -> Option<String> {
    let mut search_start = 0;
    while let Some(open) = text[search_start..].find("[[") {
        let open = search_start + open;
        let Some(close) = text[open..].find("]]") else {
            break;
        };
        let close = open + close + 2;
        if offset >= open && offset <= close {
            return Some(text[open + 2..close - 2].to_string());
        }
        search_start = close;
    }
    None
}

fn offset_of_position(text: &str, position: Position) -> usize {
    let mut offset = 0;
    for (i, line) in text.split('\n').enumerate() {
        if i as u32 == position.line {
            return offset + (position.character as usize).min(line.len());
        }
        offset += line.len() + 1;
    }
    text.len()
}

impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> RpcResult<InitializeResult> {
        if let Some(root) = params.root_uri.as_ref().and_then(uri_to_path) {
            if let Ok(project) = Project::discover(&root) {
                *self.compiler.lock() = Compiler::new(project);
            } else {
                *self.compiler.lock() = Compiler::new(Project::memory(root));
            }
        }

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "typedown".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec!["[".to_string()]),
                    ..Default::default()
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                semantic_tokens_provider: Some(
                    SemanticTokensServerCapabilities::SemanticTokensOptions(
                        SemanticTokensOptions {
                            legend: SemanticTokensLegend {
                                token_types: vec![
                                    SemanticTokenType::KEYWORD,
                                    SemanticTokenType::TYPE,
                                    SemanticTokenType::STRING,
                                ],
                                token_modifiers: vec![],
                            },
                            full: Some(SemanticTokensFullOptions::Bool(true)),
                            ..Default::default()
                        },
                    ),
                ),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "typedown language server ready")
            .await;
        self.compile_and_publish_now().await;
    }

    async fn shutdown(&self) -> RpcResult<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return;
        };
        self.compiler
            .lock()
            .source
            .update_overlay(path, params.text_document.text);
        self.document_versions
            .lock()
            .insert(uri.clone(), params.text_document.version);
        self.spawn_debounced_compile(uri);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return;
        };
        let Some(change) = params.content_changes.into_iter().next() else {
            return;
        };
        self.compiler.lock().source.update_overlay(path, change.text);
        self.document_versions
            .lock()
            .insert(uri.clone(), params.text_document.version);
        self.spawn_debounced_compile(uri);
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        self.spawn_debounced_compile(uri);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        if let Some(path) = uri_to_path(&uri) {
            self.compiler.lock().source.remove_overlay(&path);
        }
        self.document_versions.lock().remove(&uri);
        self.client.publish_diagnostics(uri, vec![], None).await;
    }

    async fn completion(&self, params: CompletionParams) -> RpcResult<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri;
        if uri_to_path(&uri).is_none() {
            return Ok(None);
        }
        let compiler = self.compiler.lock();
        let result = compiler.compile(&CompileOptions {
            target: None,
            stage: Stage::Local,
        });

        let mut items = Vec::new();
        for block_ref in result.table.iter_entities() {
            if let Some(Resolved::Entity(entity)) = result.store.resolve(block_ref) {
                items.push(CompletionItem {
                    label: entity.id.clone(),
                    kind: Some(CompletionItemKind::VALUE),
                    detail: Some(entity.class_name.clone()),
                    ..Default::default()
                });
            }
        }
        for block_ref in result.table.iter_models() {
            if let Some(Resolved::Model(model)) = result.store.resolve(block_ref) {
                items.push(CompletionItem {
                    label: model.name.clone(),
                    kind: Some(CompletionItemKind::CLASS),
                    ..Default::default()
                });
            }
        }
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn hover(&self, params: HoverParams) -> RpcResult<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some(path) = uri_to_path(&uri) else {
            return Ok(None);
        };

        let compiler = self.compiler.lock();
        let result = compiler.compile(&CompileOptions::default());
        let Ok(text) = compiler.source.get_content(&path) else {
            return Ok(None);
        };
        let offset = offset_of_position(&text, position);
        let Some(reference) = reference_at_offset(&text, offset) else {
            return Ok(None);
        };

        let engine = QueryEngine::new(&result.table, &result.store, compiler.root());
        let contents = match engine.resolve_query(&reference, &path) {
            Ok(value) => format!("**{reference}**\n\n```json\n{value:#}\n```"),
            Err(e) => format!("`{reference}` did not resolve: {e}"),
        };

        Ok(Some(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: contents,
            }),
            range: None,
        }))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> RpcResult<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some(path) = uri_to_path(&uri) else {
            return Ok(None);
        };

        let compiler = self.compiler.lock();
        let Ok(text) = compiler.source.get_content(&path) else {
            return Ok(None);
        };
        let offset = offset_of_position(&text, position);
        let Some(raw) = reference_at_offset(&text, offset) else {
            return Ok(None);
        };
        let (root, _) = crate::identifier::split_query(&raw);
        let identifier = Identifier::parse(root);

        let result = compiler.compile(&CompileOptions::default());
        let block_ref = match &identifier {
            Identifier::Hash(hex) => result.table.resolve_hash(hex),
            Identifier::Id(name) => result.table.resolve_id(name, &path, compiler.root()),
        };
        let Some(block_ref) = block_ref else {
            return Ok(None);
        };
        let Some(resolved) = result.store.resolve(block_ref) else {
            return Ok(None);
        };
        let location = resolved.location();
        let Some(target_uri) = path_to_uri(&location.file_path) else {
            return Ok(None);
        };

        let lsp_range = Range::new(
            Position::new((location.line_start.saturating_sub(1)) as u32, 0),
            Position::new((location.line_end.saturating_sub(1)) as u32, 0),
        );
        Ok(Some(GotoDefinitionResponse::Scalar(Location::new(
            target_uri, lsp_range,
        ))))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> RpcResult<Option<DocumentSymbolResponse>> {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return Ok(None);
        };

        let compiler = self.compiler.lock();
        let result = compiler.compile(&CompileOptions::default());
        let Some(path_id) = result.store.path_id(&path) else {
            return Ok(Some(DocumentSymbolResponse::Flat(vec![])));
        };
        let Some(document) = result.store.get(path_id) else {
            return Ok(Some(DocumentSymbolResponse::Flat(vec![])));
        };

        #[allow(deprecated)]
        let symbols: Vec<SymbolInformation> = document
            .blocks()
            .filter_map(|block| {
                let name = block.id()?.to_string();
                let loc = block.location();
                let range = Range::new(
                    Position::new((loc.line_start.saturating_sub(1)) as u32, 0),
                    Position::new((loc.line_end.saturating_sub(1)) as u32, 0),
                );
                let kind = match &block {
                    crate::document::Block::Model(_) => SymbolKind::CLASS,
                    crate::document::Block::Entity(_) => SymbolKind::OBJECT,
                    crate::document::Block::Spec(_) => SymbolKind::FUNCTION,
                    crate::document::Block::Config(_) => SymbolKind::NAMESPACE,
                };
                Some(SymbolInformation {
                    name,
                    kind,
                    tags: None,
                    deprecated: None,
                    location: Location::new(uri.clone(), range),
                    container_name: None,
                })
            })
            .collect();

        Ok(Some(DocumentSymbolResponse::Flat(symbols)))
    }

    async fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> RpcResult<Option<SemanticTokensResult>> {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return Ok(None);
        };
        let compiler = self.compiler.lock();
        let result = compiler.compile(&CompileOptions::default());
        let Some(path_id) = result.store.path_id(&path) else {
            return Ok(None);
        };
        let Some(document) = result.store.get(path_id) else {
            return Ok(None);
        };

        let mut tokens = Vec::new();
        let mut prev_line = 0u32;
        let mut prev_start = 0u32;
        for block in document.blocks() {
            let loc = block.location();
            let line = (loc.line_start.saturating_sub(1)) as u32;
            let token_type = match &block {
                crate::document::Block::Model(_) => 1,
                crate::document::Block::Entity(_) => 1,
                crate::document::Block::Spec(_) => 0,
                crate::document::Block::Config(_) => 0,
            };
            let delta_line = line - prev_line;
            let delta_start = if delta_line == 0 { loc.col_start as u32 - prev_start } else { loc.col_start as u32 };
            tokens.push(SemanticToken {
                delta_line,
                delta_start,
                length: (loc.col_end.saturating_sub(loc.col_start)).max(1) as u32,
                token_type,
                token_modifiers_bitset: 0,
            });
            prev_line = line;
            prev_start = loc.col_start as u32;
        }

        Ok(Some(SemanticTokensResult::Tokens(SemanticTokens {
            result_id: None,
            data: tokens,
        })))
    }
}

impl Backend {
    /// `typedown/loadProject`: replaces the compiler wholesale with a
    /// memory-only one rooted at `params.root`, hydrated with every file in
    /// `params.files`, then compiles and publishes immediately (no debounce
    /// — this is a bulk hand-off, not an incremental edit).
    async fn load_project(&self, params: LoadProjectParams) -> RpcResult<()> {
        let root = match params.root {
            Some(root) => PathBuf::from(root),
            None => self.compiler.lock().root().to_path_buf(),
        };
        let project = Project::memory(root);
        let compiler = Compiler::in_memory(project);
        compiler
            .source
            .load_project(params.files.into_iter().map(|(k, v)| (PathBuf::from(k), v)));
        *self.compiler.lock() = compiler;
        self.compile_and_publish_now().await;
        Ok(())
    }

    /// `typedown/resetFileSystem`: drops every overlay entry and recompiles
    /// against disk content.
    async fn reset_file_system(&self, _params: ResetFileSystemParams) -> RpcResult<()> {
        self.compiler.lock().source.clear_overlay();
        self.compile_and_publish_now().await;
        Ok(())
    }

    /// `typedown/updateFile`: overlays a single file outside the normal
    /// open-buffer lifecycle, then schedules the same debounced recompile a
    /// `didChange` would.
    async fn update_file(&self, params: UpdateFileParams) -> RpcResult<()> {
        let Ok(uri) = Uri::from_str(&params.uri) else {
            return Ok(());
        };
        let Some(path) = uri_to_path(&uri) else {
            return Ok(());
        };
        self.compiler.lock().source.update_overlay(path, params.content);
        self.spawn_debounced_compile(uri);
        Ok(())
    }
}

/// Builds the `(LspService, ClientSocket)` pair with the three custom
/// Typedown notifications wired in. Shared by the stdio and TCP transports
/// so neither one silently drops the custom methods.
pub fn build_service() -> (
    tower_lsp_server::LspService<Backend>,
    tower_lsp_server::ClientSocket,
) {
    LspService::build(Backend::new)
        .custom_method("typedown/loadProject", Backend::load_project)
        .custom_method("typedown/resetFileSystem", Backend::reset_file_system)
        .custom_method("typedown/updateFile", Backend::update_file)
        .finish()
}

/// Starts the server over stdio.
pub async fn run_server() {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let (service, socket) = build_service();
    Server::new(stdin, stdout, socket).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_at_offset_finds_enclosing_brackets() {
        let text = "see [[alice.email]] for contact";
        let found = reference_at_offset(text, 10);
        assert_eq!(found, Some("alice.email".to_string()));
    }

    #[test]
    fn reference_at_offset_outside_brackets_is_none() {
        let text = "see [[alice]] here";
        assert_eq!(reference_at_offset(text, 1), None);
    }

    #[test]
    fn offset_of_position_handles_multiple_lines() {
        let text = "line one\nline two\nline three";
        assert_eq!(offset_of_position(text, Position::new(1, 2)), 9 + 2);
    }
}
